//! Tracing-based observer that emits structured log events.
//!
//! Events appear alongside normal application logs, with no extra
//! dependencies.

use crate::observability::traits::{AnalysisEvent, AnalysisObserver};

/// Observer that logs analysis events via `tracing`.
pub struct LogObserver;

impl AnalysisObserver for LogObserver {
    fn record_event(&self, event: &AnalysisEvent) {
        let kind = event.kind();
        match event {
            AnalysisEvent::BatchStarted { samples } => {
                tracing::debug!(samples, "observer: {kind}");
            }
            AnalysisEvent::ConnectorEvaluated {
                shape,
                connector,
                duration,
                vetted,
            } => {
                tracing::debug!(
                    shape,
                    connector,
                    duration_ms = duration.as_millis() as u64,
                    vetted,
                    "observer: {kind}"
                );
            }
            AnalysisEvent::SelectionChanged {
                shape,
                previous,
                selected,
            } => {
                tracing::info!(
                    shape,
                    previous = previous.as_deref().unwrap_or("main"),
                    selected = selected.as_deref().unwrap_or("main"),
                    "observer: {kind}"
                );
            }
            AnalysisEvent::OptimizationCompleted {
                result,
                updated_shapes,
            } => {
                tracing::info!(
                    samples = result.samples.len(),
                    tests = result.tests.len(),
                    evaluations = result.evaluations.len(),
                    updated_shapes,
                    "observer: {kind}"
                );
            }
            AnalysisEvent::Error { component, message } => {
                tracing::warn!(component, error = %message, "observer: {kind}");
            }
            AnalysisEvent::AnalysisTaskCrashed { message } => {
                tracing::error!(error = %message, "observer: {kind}");
            }
        }
    }

    fn name(&self) -> &str {
        "log"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tracing_test::traced_test;

    use super::*;
    use crate::multi_connector::analysis::AnalysisResult;

    #[test]
    fn name_is_log() {
        assert_eq!(LogObserver.name(), "log");
    }

    #[traced_test]
    #[test]
    fn logs_selection_changes() {
        LogObserver.record_event(&AnalysisEvent::SelectionChanged {
            shape: "\"Summarize\"".into(),
            previous: None,
            selected: Some("cheap".into()),
        });
        assert!(logs_contain("analysis.selection_changed"));
        assert!(logs_contain("cheap"));
    }

    #[traced_test]
    #[test]
    fn logs_every_variant_without_panicking() {
        let obs = LogObserver;
        obs.record_event(&AnalysisEvent::BatchStarted { samples: 3 });
        obs.record_event(&AnalysisEvent::OptimizationCompleted {
            result: Arc::new(AnalysisResult::default()),
            updated_shapes: 0,
        });
        obs.record_event(&AnalysisEvent::Error {
            component: "persistence".into(),
            message: "read-only".into(),
        });
        obs.record_event(&AnalysisEvent::AnalysisTaskCrashed {
            message: "main connector failed".into(),
        });
        obs.flush();
        assert!(logs_contain("analysis.task_crashed"));
    }
}
