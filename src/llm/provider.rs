//! Text-completion provider trait and types.

use std::hash::{Hash, Hasher};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::LlmError;

/// Request settings passed alongside a prompt.
///
/// Connectors receive adjusted clones of these; the caller's value is never
/// modified.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequestSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Nucleus sampling parameter (0.0 to 1.0).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    /// Penalize new tokens based on whether they appear in the text so far (-2.0 to 2.0).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    /// Penalize new tokens based on their frequency in the text so far (-2.0 to 2.0).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,
    /// Number of completions to generate.
    #[serde(default = "default_results_per_prompt")]
    pub results_per_prompt: u32,
}

fn default_results_per_prompt() -> u32 {
    1
}

impl Default for CompletionRequestSettings {
    fn default() -> Self {
        Self {
            max_tokens: None,
            temperature: None,
            top_p: None,
            presence_penalty: None,
            frequency_penalty: None,
            stop_sequences: Vec::new(),
            results_per_prompt: default_results_per_prompt(),
        }
    }
}

impl CompletionRequestSettings {
    /// Settings with every optional knob unset.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set max tokens.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Set temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Set top_p (nucleus sampling).
    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = Some(top_p);
        self
    }

    /// Add a stop sequence.
    pub fn with_stop_sequence(mut self, stop: impl Into<String>) -> Self {
        self.stop_sequences.push(stop.into());
        self
    }
}

fn f32_bits(value: Option<f32>) -> Option<u32> {
    value.map(f32::to_bits)
}

// Floats are compared by bit pattern so that settings can key hash maps.
impl PartialEq for CompletionRequestSettings {
    fn eq(&self, other: &Self) -> bool {
        self.max_tokens == other.max_tokens
            && f32_bits(self.temperature) == f32_bits(other.temperature)
            && f32_bits(self.top_p) == f32_bits(other.top_p)
            && f32_bits(self.presence_penalty) == f32_bits(other.presence_penalty)
            && f32_bits(self.frequency_penalty) == f32_bits(other.frequency_penalty)
            && self.stop_sequences == other.stop_sequences
            && self.results_per_prompt == other.results_per_prompt
    }
}

impl Eq for CompletionRequestSettings {}

impl Hash for CompletionRequestSettings {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.max_tokens.hash(state);
        f32_bits(self.temperature).hash(state);
        f32_bits(self.top_p).hash(state);
        f32_bits(self.presence_penalty).hash(state);
        f32_bits(self.frequency_penalty).hash(state);
        self.stop_sequences.hash(state);
        self.results_per_prompt.hash(state);
    }
}

/// Why the completion finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    Unknown,
}

/// One completion returned by a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextCompletionResult {
    pub content: String,
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
    pub finish_reason: FinishReason,
}

impl TextCompletionResult {
    /// A finished result without usage information.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            input_tokens: None,
            output_tokens: None,
            finish_reason: FinishReason::Stop,
        }
    }
}

/// An incremental piece of a streamed completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamingTextChunk {
    pub content: String,
    /// Set on the final chunk.
    pub finish_reason: Option<FinishReason>,
}

/// Stream of incremental completion chunks.
pub type TextCompletionStream = BoxStream<'static, Result<StreamingTextChunk, LlmError>>;

/// Trait for text-completion backends.
///
/// The router wraps implementations of this trait and implements it itself,
/// so it can stand in anywhere a single provider is expected.
#[async_trait]
pub trait TextCompletion: Send + Sync {
    /// Get the model (or backend) name.
    fn model_name(&self) -> &str;

    /// Complete a prompt.
    ///
    /// Implementations should stop promptly once `cancel` fires.
    async fn get_completions(
        &self,
        prompt: &str,
        settings: &CompletionRequestSettings,
        cancel: &CancellationToken,
    ) -> Result<Vec<TextCompletionResult>, LlmError>;

    /// Complete a prompt incrementally.
    ///
    /// Default implementation runs [`get_completions`](Self::get_completions)
    /// and yields the first result as a single final chunk.
    async fn get_streaming_completions(
        &self,
        prompt: &str,
        settings: &CompletionRequestSettings,
        cancel: &CancellationToken,
    ) -> Result<TextCompletionStream, LlmError> {
        let results = self.get_completions(prompt, settings, cancel).await?;
        let chunks: Vec<Result<StreamingTextChunk, LlmError>> = results
            .into_iter()
            .take(1)
            .map(|r| {
                Ok(StreamingTextChunk {
                    content: r.content,
                    finish_reason: Some(r.finish_reason),
                })
            })
            .collect();
        Ok(stream::iter(chunks).boxed())
    }
}
