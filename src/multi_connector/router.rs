//! The multi-connector router.
//!
//! [`MultiTextCompletion`] implements [`TextCompletion`] itself, so callers
//! use it like any single provider. Each request is classified into a prompt
//! shape, sent to the connector currently selected for that shape, and
//! returned to the caller as soon as the provider answers. Cost accounting and
//! sampling for the analysis task happen in a spawned bookkeeping task.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{AnalysisError, ConfigError, LlmError};
use crate::llm::{
    CompletionRequestSettings, StreamingTextChunk, TextCompletion, TextCompletionResult,
    TextCompletionStream,
};
use crate::multi_connector::analysis::{
    AnalysisContext, AnalysisResult, QueuedSample, run_analysis_loop,
};
use crate::multi_connector::connector::NamedTextCompletion;
use crate::multi_connector::job::{CompletionJob, ConnectorTest};
use crate::multi_connector::settings::MultiTextCompletionSettings;
use crate::multi_connector::shape::{
    ConnectorPerformance, PromptConnectorSettings, PromptSignature,
};

/// Capacity of the completed-analysis broadcast channel.
const RESULT_CHANNEL_CAPACITY: usize = 16;

/// Result text and generation time, resolved once the full answer is known.
/// `None` when the answer never completed (stream dropped or failed).
type ResultFuture = Shared<BoxFuture<'static, Option<(Arc<str>, Duration)>>>;

/// Atomic counters for router activity.
#[derive(Debug, Default)]
pub(crate) struct RouterStats {
    total_requests: AtomicU64,
    main_requests: AtomicU64,
    secondary_requests: AtomicU64,
    failed_requests: AtomicU64,
    samples_enqueued: AtomicU64,
    bookkeeping_failures: AtomicU64,
    analysis_batches: AtomicU64,
}

impl RouterStats {
    pub(crate) fn record_batch(&self) {
        self.analysis_batches.fetch_add(1, Ordering::Relaxed);
    }
}

/// Snapshot of router statistics for external consumption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouterStatsSnapshot {
    pub total_requests: u64,
    pub main_requests: u64,
    pub secondary_requests: u64,
    pub failed_requests: u64,
    pub samples_enqueued: u64,
    pub bookkeeping_failures: u64,
    pub analysis_batches: u64,
}

/// Routing state of one prompt shape, for export.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShapeRoutingSnapshot {
    pub prompt_start: String,
    /// Resolved connector name (the main connector when nothing is selected).
    pub selected_connector: String,
    pub performances: BTreeMap<String, ConnectorPerformance>,
    pub test_counts: BTreeMap<String, u32>,
}

/// Routing state of every known prompt shape.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutingSnapshot {
    pub main_connector: String,
    pub shapes: Vec<ShapeRoutingSnapshot>,
}

/// Routes text completions across several connectors and learns, per prompt
/// shape, which one to use.
///
/// `connectors[0]` is the main connector: it serves every shape until a
/// cheaper connector has been vetted against it.
pub struct MultiTextCompletion {
    connectors: Arc<[Arc<NamedTextCompletion>]>,
    settings: Arc<MultiTextCompletionSettings>,
    /// Read on every request, written only when a shape is learned.
    shapes: RwLock<Vec<Arc<PromptConnectorSettings>>>,
    samples: Option<mpsc::UnboundedSender<QueuedSample>>,
    stats: Arc<RouterStats>,
    results: broadcast::Sender<Arc<AnalysisResult>>,
    analysis_cancel: CancellationToken,
    analysis_task: Mutex<Option<JoinHandle<Result<(), AnalysisError>>>>,
}

impl MultiTextCompletion {
    /// Build the router and start the analysis task.
    ///
    /// `cancel` stops the analysis task; requests carry their own tokens.
    /// With analysis enabled this must be called inside a Tokio runtime.
    pub fn new(
        settings: MultiTextCompletionSettings,
        connectors: Vec<NamedTextCompletion>,
        cancel: &CancellationToken,
    ) -> Result<Self, ConfigError> {
        validate_connectors(&connectors)?;

        let connectors: Arc<[Arc<NamedTextCompletion>]> =
            connectors.into_iter().map(Arc::new).collect();
        let shapes = settings
            .prompt_shapes
            .iter()
            .map(|s| Arc::new(PromptConnectorSettings::from_shape_settings(s)))
            .collect();
        let settings = Arc::new(settings);
        let stats = Arc::new(RouterStats::default());
        let (results, _) = broadcast::channel(RESULT_CHANNEL_CAPACITY);
        let analysis_cancel = cancel.child_token();

        let (samples, analysis_task) = if settings.analysis.enabled {
            let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
                ConfigError::InvalidValue {
                    key: "analysis.enabled".to_string(),
                    message: "background analysis requires a running Tokio runtime".to_string(),
                }
            })?;
            let (tx, rx) = mpsc::unbounded_channel();
            let ctx = AnalysisContext {
                connectors: Arc::clone(&connectors),
                settings: Arc::clone(&settings),
                stats: Arc::clone(&stats),
                results: results.clone(),
            };
            let handle = runtime.spawn(run_analysis_loop(ctx, rx, analysis_cancel.clone()));
            (Some(tx), Some(handle))
        } else {
            (None, None)
        };

        tracing::info!(
            connectors = connectors.len(),
            main = %connectors[0].name(),
            analysis = settings.analysis.enabled,
            "Multi-connector router ready"
        );

        Ok(Self {
            connectors,
            settings,
            shapes: RwLock::new(shapes),
            samples,
            stats,
            results,
            analysis_cancel,
            analysis_task: Mutex::new(analysis_task),
        })
    }

    pub fn connectors(&self) -> &[Arc<NamedTextCompletion>] {
        &self.connectors
    }

    pub fn settings(&self) -> &MultiTextCompletionSettings {
        &self.settings
    }

    fn main(&self) -> &Arc<NamedTextCompletion> {
        // Non-empty is checked in `new`.
        &self.connectors[0]
    }

    /// Get a snapshot of routing statistics.
    pub fn stats(&self) -> RouterStatsSnapshot {
        RouterStatsSnapshot {
            total_requests: self.stats.total_requests.load(Ordering::Relaxed),
            main_requests: self.stats.main_requests.load(Ordering::Relaxed),
            secondary_requests: self.stats.secondary_requests.load(Ordering::Relaxed),
            failed_requests: self.stats.failed_requests.load(Ordering::Relaxed),
            samples_enqueued: self.stats.samples_enqueued.load(Ordering::Relaxed),
            bookkeeping_failures: self.stats.bookkeeping_failures.load(Ordering::Relaxed),
            analysis_batches: self.stats.analysis_batches.load(Ordering::Relaxed),
        }
    }

    /// Receive every completed analysis batch from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<AnalysisResult>> {
        self.results.subscribe()
    }

    /// Current routing decision and analysis data of every known shape.
    pub fn routing_snapshot(&self) -> RoutingSnapshot {
        let shapes = self.shapes.read().unwrap_or_else(|e| e.into_inner()).clone();
        let main = self.main().name().to_string();
        RoutingSnapshot {
            shapes: shapes
                .iter()
                .map(|shape| {
                    let selection = shape.selection();
                    ShapeRoutingSnapshot {
                        prompt_start: shape.signature().prompt_start().to_string(),
                        selected_connector: selection
                            .selected_connector
                            .clone()
                            .unwrap_or_else(|| main.clone()),
                        performances: selection.performances.clone(),
                        test_counts: shape.test_counts(),
                    }
                })
                .collect(),
            main_connector: main,
        }
    }

    /// Shape settings for `prompt`, learning a new shape if allowed.
    ///
    /// The longest matching signature wins. `None` when shapes are frozen and
    /// nothing matches.
    pub fn prompt_settings(&self, prompt: &str) -> Option<Arc<PromptConnectorSettings>> {
        if let Some(found) = find_shape(&self.shapes.read().unwrap_or_else(|e| e.into_inner()), prompt)
        {
            return Some(found);
        }
        if self.settings.freeze_prompt_shapes {
            return None;
        }

        let mut shapes = self.shapes.write().unwrap_or_else(|e| e.into_inner());
        // Another request may have learned it while we waited for the lock.
        if let Some(found) = find_shape(&shapes, prompt) {
            return Some(found);
        }
        let signature =
            PromptSignature::from_prompt(prompt, self.settings.prompt_truncation_length);
        tracing::debug!(shape = %signature, "Learned new prompt shape");
        let shape = Arc::new(PromptConnectorSettings::new(signature));
        shapes.push(Arc::clone(&shape));
        Some(shape)
    }

    /// Stop the analysis task and wait for it to finish.
    ///
    /// Returns the task's own error if it had crashed.
    pub async fn shutdown(&self) -> Result<(), AnalysisError> {
        self.analysis_cancel.cancel();
        let handle = self
            .analysis_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match handle {
            Some(handle) => handle.await.map_err(|e| AnalysisError::TaskAborted {
                reason: e.to_string(),
            })?,
            None => Ok(()),
        }
    }

    /// Whether the analysis task is still running.
    pub fn is_analysis_running(&self) -> bool {
        self.analysis_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    fn route(
        &self,
        prompt: &str,
        settings: &CompletionRequestSettings,
    ) -> Route {
        self.stats.total_requests.fetch_add(1, Ordering::Relaxed);

        let shape = self.prompt_settings(prompt);
        let connector = match &shape {
            Some(shape) => shape
                .select_connector(&self.connectors)
                .unwrap_or_else(|| self.main()),
            None => self.main(),
        };
        let connector = Arc::clone(connector);
        let is_main = Arc::ptr_eq(&connector, self.main());
        if is_main {
            self.stats.main_requests.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.secondary_requests.fetch_add(1, Ordering::Relaxed);
        }

        let (adjusted_prompt, adjusted_settings) = connector.adjust_prompt_and_request_settings(
            prompt,
            settings,
            shape.as_deref(),
            &self.settings,
        );

        tracing::debug!(
            connector = %connector.name(),
            shape = %shape.as_ref().map(|s| s.signature().to_string()).unwrap_or_default(),
            "Routing completion request"
        );

        Route {
            job: CompletionJob::new(prompt, settings.clone()),
            shape,
            connector,
            is_main,
            adjusted_prompt,
            adjusted_settings,
        }
    }

    fn record_failure(&self, connector: &NamedTextCompletion, err: &LlmError) {
        self.stats.failed_requests.fetch_add(1, Ordering::Relaxed);
        if err.is_cancellation() {
            tracing::debug!(connector = %connector.name(), "Completion request cancelled");
        } else {
            tracing::warn!(connector = %connector.name(), error = %err, "Connector request failed");
        }
    }

    /// Spawn cost crediting and sampling for one request.
    fn spawn_bookkeeping(&self, route: Route, result: ResultFuture) {
        let sampling = if route.is_main && self.settings.analysis.enabled {
            self.samples.clone().zip(route.shape.clone())
        } else {
            None
        };
        let creditor = self.settings.creditor.clone();
        let stats = Arc::clone(&self.stats);
        let limit = self.settings.analysis.samples_per_shape;

        tokio::spawn(async move {
            let Some((text, duration)) = result.await else {
                tracing::debug!(
                    connector = %route.connector.name(),
                    "Completion did not finish; skipping bookkeeping"
                );
                return;
            };

            let cost = route.connector.get_cost(&route.adjusted_prompt, &text);
            if let Some(creditor) = creditor {
                creditor.credit(cost);
            }

            let Some((tx, shape)) = sampling else {
                return;
            };
            if !shape.try_reserve_sample(route.connector.name(), limit) {
                return;
            }
            let test = ConnectorTest::new(
                route.job,
                route.connector.name(),
                text.to_string(),
                duration,
                cost,
            );
            match tx.send(QueuedSample {
                shape: Arc::clone(&shape),
                test,
            }) {
                Ok(()) => {
                    stats.samples_enqueued.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => {
                    stats.bookkeeping_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        shape = %shape.signature(),
                        "Analysis task is not running; dropping sample"
                    );
                }
            }
        });
    }
}

impl Drop for MultiTextCompletion {
    fn drop(&mut self) {
        self.analysis_cancel.cancel();
    }
}

impl std::fmt::Debug for MultiTextCompletion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.connectors.iter().map(|c| c.name()).collect();
        f.debug_struct("MultiTextCompletion")
            .field("connectors", &names)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// Everything decided about a request before the provider is called.
struct Route {
    /// Caller's prompt and settings, replayed by analysis.
    job: CompletionJob,
    shape: Option<Arc<PromptConnectorSettings>>,
    connector: Arc<NamedTextCompletion>,
    is_main: bool,
    adjusted_prompt: String,
    adjusted_settings: CompletionRequestSettings,
}

fn validate_connectors(connectors: &[NamedTextCompletion]) -> Result<(), ConfigError> {
    if connectors.is_empty() {
        return Err(ConfigError::NoConnectors);
    }
    let mut seen = std::collections::HashSet::new();
    for connector in connectors {
        if !seen.insert(connector.name()) {
            return Err(ConfigError::DuplicateConnector {
                name: connector.name().to_string(),
            });
        }
        let pct = connector.max_tokens_reserve_percentage();
        if !(1..=100).contains(&pct) {
            return Err(ConfigError::InvalidValue {
                key: format!("connectors.{}.max_tokens_reserve_percentage", connector.name()),
                message: format!("{pct} is outside 1..=100"),
            });
        }
    }
    Ok(())
}

fn find_shape(
    shapes: &[Arc<PromptConnectorSettings>],
    prompt: &str,
) -> Option<Arc<PromptConnectorSettings>> {
    shapes
        .iter()
        .filter(|s| s.signature().matches(prompt))
        .max_by_key(|s| s.signature().prompt_start().len())
        .cloned()
}

/// Race a provider call against the caller's cancellation token.
async fn cancellable<T>(
    connector: &NamedTextCompletion,
    cancel: &CancellationToken,
    call: impl std::future::Future<Output = Result<T, LlmError>>,
) -> Result<T, LlmError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(LlmError::Cancelled {
            provider: connector.name().to_string(),
        }),
        result = call => result,
    }
}

#[async_trait]
impl TextCompletion for MultiTextCompletion {
    fn model_name(&self) -> &str {
        self.main().provider().model_name()
    }

    async fn get_completions(
        &self,
        prompt: &str,
        settings: &CompletionRequestSettings,
        cancel: &CancellationToken,
    ) -> Result<Vec<TextCompletionResult>, LlmError> {
        let route = self.route(prompt, settings);
        let start = Instant::now();
        let provider = route.connector.provider();
        let results = match cancellable(
            &route.connector,
            cancel,
            provider.get_completions(&route.adjusted_prompt, &route.adjusted_settings, cancel),
        )
        .await
        {
            Ok(results) => results,
            Err(e) => {
                self.record_failure(&route.connector, &e);
                return Err(e);
            }
        };
        let duration = start.elapsed();

        let text: Option<Arc<str>> = results.first().map(|r| Arc::from(r.content.as_str()));
        let result: ResultFuture = futures::future::ready(text.map(|t| (t, duration)))
            .boxed()
            .shared();
        self.spawn_bookkeeping(route, result);

        Ok(results)
    }

    async fn get_streaming_completions(
        &self,
        prompt: &str,
        settings: &CompletionRequestSettings,
        cancel: &CancellationToken,
    ) -> Result<TextCompletionStream, LlmError> {
        let route = self.route(prompt, settings);
        let start = Instant::now();
        let provider = route.connector.provider();
        let inner = match cancellable(
            &route.connector,
            cancel,
            provider.get_streaming_completions(
                &route.adjusted_prompt,
                &route.adjusted_settings,
                cancel,
            ),
        )
        .await
        {
            Ok(stream) => stream,
            Err(e) => {
                self.record_failure(&route.connector, &e);
                return Err(e);
            }
        };

        let (done_tx, done_rx) = oneshot::channel();
        let result: ResultFuture = async move { done_rx.await.ok() }.boxed().shared();
        self.spawn_bookkeeping(route, result);

        Ok(RecordingStream {
            inner,
            text: String::new(),
            start,
            done: Some(done_tx),
        }
        .boxed())
    }
}

/// Passes chunks through to the caller and resolves the result future with
/// the full text once the stream ends cleanly.
///
/// An error chunk or an early drop discards the sender, so the request is
/// never credited or sampled.
struct RecordingStream {
    inner: TextCompletionStream,
    text: String,
    start: Instant,
    done: Option<oneshot::Sender<(Arc<str>, Duration)>>,
}

impl Stream for RecordingStream {
    type Item = Result<StreamingTextChunk, LlmError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        match this.inner.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.text.push_str(&chunk.content);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.done = None;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                if let Some(done) = this.done.take() {
                    let text: Arc<str> = Arc::from(std::mem::take(&mut this.text));
                    // Bookkeeping may already be gone at runtime shutdown.
                    let _ = done.send((text, this.start.elapsed()));
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
