//! Test doubles for text-completion providers.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::LlmError;
use crate::llm::{CompletionRequestSettings, TextCompletion, TextCompletionResult};

type Responder = Box<dyn Fn(&str) -> Result<String, LlmError> + Send + Sync>;

/// A scripted provider that records every prompt it receives.
///
/// By default it answers every prompt with a fixed response. Use
/// [`StubCompletion::with_responder`] to answer based on the prompt text.
pub struct StubCompletion {
    model_name: String,
    responder: Responder,
    failing: AtomicBool,
    delay: Option<Duration>,
    calls: AtomicU32,
    prompts: Mutex<Vec<String>>,
    settings: Mutex<Vec<CompletionRequestSettings>>,
}

impl StubCompletion {
    /// A provider that always answers `response`.
    pub fn new(response: impl Into<String>) -> Self {
        let response = response.into();
        Self::with_responder(move |_| Ok(response.clone()))
    }

    /// A provider that answers with `responder(prompt)`.
    pub fn with_responder<F>(responder: F) -> Self
    where
        F: Fn(&str) -> Result<String, LlmError> + Send + Sync + 'static,
    {
        Self {
            model_name: "stub-model".to_string(),
            responder: Box::new(responder),
            failing: AtomicBool::new(false),
            delay: None,
            calls: AtomicU32::new(0),
            prompts: Mutex::new(Vec::new()),
            settings: Mutex::new(Vec::new()),
        }
    }

    /// Override the reported model name.
    pub fn with_model_name(mut self, name: impl Into<String>) -> Self {
        self.model_name = name.into();
        self
    }

    /// Sleep for `delay` before answering (cancellable).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Make subsequent calls fail with `RequestFailed`.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    /// Number of completed or attempted calls.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Every prompt received, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Every settings object received, in call order.
    pub fn received_settings(&self) -> Vec<CompletionRequestSettings> {
        self.settings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Default for StubCompletion {
    fn default() -> Self {
        Self::new("stub response")
    }
}

#[async_trait]
impl TextCompletion for StubCompletion {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn get_completions(
        &self,
        prompt: &str,
        settings: &CompletionRequestSettings,
        cancel: &CancellationToken,
    ) -> Result<Vec<TextCompletionResult>, LlmError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(prompt.to_string());
        self.settings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(settings.clone());

        if let Some(delay) = self.delay {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(LlmError::Cancelled { provider: self.model_name.clone() });
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        if self.failing.load(Ordering::Relaxed) {
            return Err(LlmError::RequestFailed {
                provider: self.model_name.clone(),
                reason: "stub configured to fail".to_string(),
            });
        }

        let content = (self.responder)(prompt)?;
        Ok(vec![TextCompletionResult::text(content)])
    }
}
