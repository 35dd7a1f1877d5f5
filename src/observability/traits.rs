//! Core observer trait and analysis event types.

use std::sync::Arc;
use std::time::Duration;

use crate::multi_connector::analysis::AnalysisResult;

/// Receives events from the background analysis task.
///
/// Implementations can log to tracing, collect for tests, or forward to an
/// external sink. Called from the analysis task, so they must not block for
/// long.
pub trait AnalysisObserver: Send + Sync {
    /// Record a discrete analysis event.
    fn record_event(&self, event: &AnalysisEvent);

    /// Flush any buffered data. No-op by default.
    fn flush(&self) {}

    /// Human-readable backend name (e.g. "log", "recording").
    fn name(&self) -> &str;
}

/// Events emitted by the analysis pipeline.
#[derive(Debug, Clone)]
pub enum AnalysisEvent {
    /// A batch of samples was drained from the queue.
    BatchStarted { samples: usize },

    /// A secondary connector was replayed and vetted on one sample.
    ConnectorEvaluated {
        shape: String,
        connector: String,
        duration: Duration,
        vetted: bool,
    },

    /// A shape's selected connector changed.
    SelectionChanged {
        shape: String,
        previous: Option<String>,
        selected: Option<String>,
    },

    /// A batch was fully processed and routing updated.
    OptimizationCompleted {
        result: Arc<AnalysisResult>,
        updated_shapes: usize,
    },

    /// A non-fatal failure inside the pipeline (e.g. persistence).
    Error { component: String, message: String },

    /// The analysis task stopped on an unexpected error. Routing keeps its
    /// last selection.
    AnalysisTaskCrashed { message: String },
}

impl AnalysisEvent {
    /// Short dotted name, used as the log message.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BatchStarted { .. } => "analysis.batch_started",
            Self::ConnectorEvaluated { .. } => "analysis.connector_evaluated",
            Self::SelectionChanged { .. } => "analysis.selection_changed",
            Self::OptimizationCompleted { .. } => "analysis.optimization_completed",
            Self::Error { .. } => "analysis.error",
            Self::AnalysisTaskCrashed { .. } => "analysis.task_crashed",
        }
    }
}
