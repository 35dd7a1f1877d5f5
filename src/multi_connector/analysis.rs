//! Background analysis: batches samples, evaluates connectors and updates
//! per-shape routing.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::error::AnalysisError;
use crate::multi_connector::connector::NamedTextCompletion;
use crate::multi_connector::job::ConnectorTest;
use crate::multi_connector::router::RouterStats;
use crate::multi_connector::settings::MultiTextCompletionSettings;
use crate::multi_connector::shape::PromptConnectorSettings;
use crate::observability::AnalysisEvent;

/// Verdict on one secondary connector's answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorEvaluation {
    /// The secondary connector's run.
    pub test: ConnectorTest,
    /// Connector that judged the answer (the main one).
    pub vetting_connector: String,
    pub is_vetted: bool,
}

/// Everything one analysis batch produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub timestamp: DateTime<Utc>,
    /// Main-connector samples taken from live traffic.
    pub samples: Vec<ConnectorTest>,
    /// Replays on secondary connectors.
    pub tests: Vec<ConnectorTest>,
    pub evaluations: Vec<ConnectorEvaluation>,
}

impl Default for AnalysisResult {
    fn default() -> Self {
        Self {
            timestamp: Utc::now(),
            samples: Vec::new(),
            tests: Vec::new(),
            evaluations: Vec::new(),
        }
    }
}

impl AnalysisResult {
    /// Write the result as pretty JSON, replacing any previous file.
    pub async fn save(&self, path: &Path) -> Result<(), AnalysisError> {
        let json = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, json)
            .await
            .map_err(|e| AnalysisError::Persistence {
                path: path.display().to_string(),
                reason: e.to_string(),
            })
    }

    pub async fn load(path: &Path) -> Result<Self, AnalysisError> {
        let json = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| AnalysisError::Persistence {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        Ok(serde_json::from_str(&json)?)
    }
}

/// A sample waiting in the analysis queue, tagged with its shape.
#[derive(Debug)]
pub(crate) struct QueuedSample {
    pub shape: Arc<PromptConnectorSettings>,
    pub test: ConnectorTest,
}

/// State the analysis task shares with the router.
pub(crate) struct AnalysisContext {
    pub connectors: Arc<[Arc<NamedTextCompletion>]>,
    pub settings: Arc<MultiTextCompletionSettings>,
    pub stats: Arc<RouterStats>,
    pub results: broadcast::Sender<Arc<AnalysisResult>>,
}

impl AnalysisContext {
    fn notify(&self, event: &AnalysisEvent) {
        for observer in &self.settings.observers {
            observer.record_event(event);
        }
    }

    /// Process one drained batch end to end.
    async fn analyze_batch(
        &self,
        batch: Vec<QueuedSample>,
        cancel: &CancellationToken,
    ) -> Result<Arc<AnalysisResult>, AnalysisError> {
        let mut seen: HashSet<String> = HashSet::new();
        let batch: Vec<QueuedSample> = batch
            .into_iter()
            .filter(|s| {
                if seen.insert(s.test.job.fingerprint()) {
                    return true;
                }
                // Duplicates are not evaluated, so they must not use up the
                // shape's sample budget.
                s.shape.release_sample(&s.test.connector_name);
                tracing::debug!(
                    shape = %s.shape.signature(),
                    "Dropped duplicate sample; slot released"
                );
                false
            })
            .collect();

        self.stats.record_batch();
        self.notify(&AnalysisEvent::BatchStarted {
            samples: batch.len(),
        });
        tracing::debug!(samples = batch.len(), "Analyzing sample batch");

        let mut result = AnalysisResult::default();
        let mut per_shape: Vec<(Arc<PromptConnectorSettings>, Vec<usize>, Vec<usize>)> =
            Vec::new();

        for sample in &batch {
            let outcome = self
                .settings
                .evaluator
                .evaluate(
                    &sample.test,
                    &sample.shape,
                    &self.connectors,
                    &self.settings,
                    cancel,
                )
                .await?;

            let slot = match per_shape
                .iter()
                .position(|(shape, _, _)| Arc::ptr_eq(shape, &sample.shape))
            {
                Some(i) => i,
                None => {
                    per_shape.push((Arc::clone(&sample.shape), Vec::new(), Vec::new()));
                    per_shape.len() - 1
                }
            };

            per_shape[slot].1.push(result.samples.len());
            result.samples.push(sample.test.clone());

            for evaluation in outcome.evaluations {
                self.notify(&AnalysisEvent::ConnectorEvaluated {
                    shape: sample.shape.signature().to_string(),
                    connector: evaluation.test.connector_name.clone(),
                    duration: evaluation.test.duration,
                    vetted: evaluation.is_vetted,
                });
                per_shape[slot].2.push(result.evaluations.len());
                result.evaluations.push(evaluation);
            }
            result.tests.extend(outcome.tests);
        }

        let analysis = &self.settings.analysis;
        let mut updated_shapes = 0;
        for (shape, sample_ix, eval_ix) in &per_shape {
            let samples: Vec<&ConnectorTest> = sample_ix.iter().map(|&i| &result.samples[i]).collect();
            let evaluations: Vec<&ConnectorEvaluation> =
                eval_ix.iter().map(|&i| &result.evaluations[i]).collect();

            let current = shape.selection();
            let mut next = current.updated(
                &self.connectors,
                &samples,
                &evaluations,
                analysis.samples_per_shape,
                self.settings.comparer.as_ref(),
            );
            if !analysis.update_routing {
                next.selected_connector = current.selected_connector.clone();
            }

            if next.selected_connector != current.selected_connector {
                tracing::info!(
                    shape = %shape.signature(),
                    previous = current.selected_connector.as_deref().unwrap_or("main"),
                    selected = next.selected_connector.as_deref().unwrap_or("main"),
                    "Prompt shape routing updated"
                );
                self.notify(&AnalysisEvent::SelectionChanged {
                    shape: shape.signature().to_string(),
                    previous: current.selected_connector.clone(),
                    selected: next.selected_connector.clone(),
                });
                updated_shapes += 1;
            }
            shape.replace_selection(next);
        }

        let result = Arc::new(result);

        if let Some(path) = &analysis.analysis_file {
            if let Err(e) = result.save(path).await {
                tracing::warn!(error = %e, "Failed to persist analysis result");
                self.notify(&AnalysisEvent::Error {
                    component: "persistence".to_string(),
                    message: e.to_string(),
                });
            }
        }

        self.notify(&AnalysisEvent::OptimizationCompleted {
            result: Arc::clone(&result),
            updated_shapes,
        });
        for observer in &self.settings.observers {
            observer.flush();
        }
        // No subscribers is fine.
        let _ = self.results.send(Arc::clone(&result));

        Ok(result)
    }
}

/// Receive the next sample, or `None` on cancellation or a closed queue.
async fn next_sample(
    rx: &mut mpsc::UnboundedReceiver<QueuedSample>,
    cancel: &CancellationToken,
) -> Option<QueuedSample> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        item = rx.recv() => item,
    }
}

/// The long-running analysis loop.
///
/// Waits for a first sample, then keeps sleeping `analysis_delay` and
/// draining until a sleep yields nothing new, and analyzes the batch.
/// `cancel` is checked between batches only; a batch already drained is
/// finished before the loop exits. Returns `Ok(())` on cancellation or when
/// the router is dropped.
pub(crate) async fn run_analysis_loop(
    ctx: AnalysisContext,
    mut rx: mpsc::UnboundedReceiver<QueuedSample>,
    cancel: CancellationToken,
) -> Result<(), AnalysisError> {
    let delay = ctx.settings.analysis.analysis_delay;

    while let Some(first) = next_sample(&mut rx, &cancel).await {
        let mut batch = vec![first];
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            let before = batch.len();
            while let Ok(sample) = rx.try_recv() {
                batch.push(sample);
            }
            if batch.len() == before {
                break;
            }
        }

        // A drained batch always runs to completion, even when shutdown was
        // requested while it was being collected or evaluated.
        let batch_cancel = CancellationToken::new();
        match ctx.analyze_batch(batch, &batch_cancel).await {
            Ok(_) => {}
            Err(e) if e.is_cancellation() => break,
            Err(e) => {
                tracing::error!(error = %e, "Analysis task stopped; routing keeps its last selection");
                ctx.notify(&AnalysisEvent::AnalysisTaskCrashed {
                    message: e.to_string(),
                });
                return Err(e);
            }
        }

        if cancel.is_cancelled() {
            break;
        }
    }

    tracing::debug!("Analysis task exiting");
    Ok(())
}
