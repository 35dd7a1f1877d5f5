//! Multi-connector text completion.
//!
//! A [`MultiTextCompletion`] sits in front of several [`NamedTextCompletion`]s.
//! The first connector is the main one; every request goes to it until the
//! background analysis has vetted a cheaper connector for the request's prompt
//! shape, after which that shape is routed to the cheaper connector.

pub mod analysis;
pub mod comparer;
pub mod connector;
pub mod evaluator;
pub mod job;
pub mod router;
pub mod settings;
pub mod shape;
pub mod transform;

pub use analysis::{AnalysisResult, ConnectorEvaluation};
pub use comparer::{ConnectorCandidate, ConnectorComparer, WeightedCostPerformanceComparer};
pub use connector::{DEFAULT_MAX_TOKENS_RESERVE_PERCENTAGE, MaxTokensAdjustment, NamedTextCompletion};
pub use evaluator::{ConnectorEvaluator, SampleEvaluation, VettingEvaluator};
pub use job::{CompletionJob, ConnectorTest};
pub use router::{MultiTextCompletion, RouterStatsSnapshot, RoutingSnapshot, ShapeRoutingSnapshot};
pub use settings::{AnalysisSettings, MultiTextCompletionSettings};
pub use shape::{
    ConnectorPerformance, PromptConnectorSettings, PromptShapeSettings, PromptSignature,
    ShapeSelection, VettingLevel,
};
pub use transform::{
    PromptTransform, SettingsTransformFn, TemperatureTransformFn, TokenCountFn,
    approximate_token_count, clamp_temperature,
};
