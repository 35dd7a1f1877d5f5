//! Process-wide router settings.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::llm::CostCreditor;
use crate::multi_connector::comparer::{ConnectorComparer, WeightedCostPerformanceComparer};
use crate::multi_connector::evaluator::{
    ConnectorEvaluator, DEFAULT_VETTING_PROMPT_TEMPLATE, VettingEvaluator,
};
use crate::multi_connector::shape::PromptShapeSettings;
use crate::multi_connector::transform::PromptTransform;
use crate::observability::AnalysisObserver;

/// Default number of characters of a prompt that identify its shape.
pub const DEFAULT_PROMPT_TRUNCATION_LENGTH: usize = 20;

/// Default coalescing window of the analysis task.
pub const DEFAULT_ANALYSIS_DELAY: Duration = Duration::from_secs(1);

/// Default samples collected per shape, and passes needed to vet a connector.
pub const DEFAULT_SAMPLES_PER_SHAPE: u32 = 3;

/// Background analysis settings.
#[derive(Debug, Clone)]
pub struct AnalysisSettings {
    /// When false the router never samples and no analysis runs.
    pub enabled: bool,
    /// Wait after each dequeue before draining the next group of samples.
    pub analysis_delay: Duration,
    /// Main-connector samples taken per shape; also the number of passed
    /// evaluations needed to vet a secondary connector.
    pub samples_per_shape: u32,
    /// Prompt sent to the main connector to vet an answer. Uses `{prompt}`
    /// and `{result}` placeholders.
    pub vetting_prompt_template: String,
    /// Where each batch's [`AnalysisResult`](super::AnalysisResult) is written.
    pub analysis_file: Option<PathBuf>,
    /// When false, analysis records performances but never changes routing.
    pub update_routing: bool,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            analysis_delay: DEFAULT_ANALYSIS_DELAY,
            samples_per_shape: DEFAULT_SAMPLES_PER_SHAPE,
            vetting_prompt_template: DEFAULT_VETTING_PROMPT_TEMPLATE.to_string(),
            analysis_file: None,
            update_routing: true,
        }
    }
}

/// Settings read by [`MultiTextCompletion`](super::MultiTextCompletion).
///
/// Fields are public so callers can use struct-update syntax over
/// `Default::default()`.
#[derive(Clone)]
pub struct MultiTextCompletionSettings {
    /// Shapes known up front. Others are learned from traffic unless
    /// `freeze_prompt_shapes` is set.
    pub prompt_shapes: Vec<PromptShapeSettings>,
    pub comparer: Arc<dyn ConnectorComparer>,
    pub evaluator: Arc<dyn ConnectorEvaluator>,
    pub analysis: AnalysisSettings,
    /// Applied to every prompt before shape and connector transforms.
    pub global_prompt_transform: Option<PromptTransform>,
    /// Credited with the cost of every completed request.
    pub creditor: Option<Arc<CostCreditor>>,
    pub prompt_truncation_length: usize,
    /// Stop learning shapes; unmatched prompts go to the main connector
    /// unsampled.
    pub freeze_prompt_shapes: bool,
    pub observers: Vec<Arc<dyn AnalysisObserver>>,
}

impl Default for MultiTextCompletionSettings {
    fn default() -> Self {
        Self {
            prompt_shapes: Vec::new(),
            comparer: Arc::new(WeightedCostPerformanceComparer::default()),
            evaluator: Arc::new(VettingEvaluator::default()),
            analysis: AnalysisSettings::default(),
            global_prompt_transform: None,
            creditor: None,
            prompt_truncation_length: DEFAULT_PROMPT_TRUNCATION_LENGTH,
            freeze_prompt_shapes: false,
            observers: Vec::new(),
        }
    }
}

impl fmt::Debug for MultiTextCompletionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let observers: Vec<&str> = self.observers.iter().map(|o| o.name()).collect();
        f.debug_struct("MultiTextCompletionSettings")
            .field("prompt_shapes", &self.prompt_shapes)
            .field("comparer", &self.comparer)
            .field("evaluator", &self.evaluator)
            .field("analysis", &self.analysis)
            .field("global_prompt_transform", &self.global_prompt_transform)
            .field("creditor", &self.creditor.is_some())
            .field("prompt_truncation_length", &self.prompt_truncation_length)
            .field("freeze_prompt_shapes", &self.freeze_prompt_shapes)
            .field("observers", &observers)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::LogObserver;

    #[test]
    fn defaults() {
        let s = MultiTextCompletionSettings::default();
        assert!(s.analysis.enabled);
        assert!(s.analysis.update_routing);
        assert_eq!(s.prompt_truncation_length, 20);
        assert!(!s.freeze_prompt_shapes);
        assert!(s.analysis.vetting_prompt_template.contains("{prompt}"));
        assert!(s.analysis.vetting_prompt_template.contains("{result}"));
    }

    #[test]
    fn debug_lists_observer_names() {
        let s = MultiTextCompletionSettings {
            observers: vec![Arc::new(LogObserver)],
            ..Default::default()
        };
        let dbg = format!("{s:?}");
        assert!(dbg.contains("\"log\""));
        assert!(dbg.contains("WeightedCostPerformanceComparer"));
    }
}
