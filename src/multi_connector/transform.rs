//! Prompt and settings transforms attached to connectors and prompt shapes.

use std::fmt;
use std::sync::Arc;

use crate::llm::CompletionRequestSettings;

/// Placeholder replaced by the incoming prompt in template transforms.
pub const PROMPT_PLACEHOLDER: &str = "{prompt}";

/// Counts tokens in a piece of text.
pub type TokenCountFn = Arc<dyn Fn(&str) -> usize + Send + Sync>;

/// Maps a requested temperature into the range a connector accepts.
pub type TemperatureTransformFn = Arc<dyn Fn(f32) -> f32 + Send + Sync>;

/// Rewrites a whole settings object for a connector.
pub type SettingsTransformFn =
    Arc<dyn Fn(&CompletionRequestSettings) -> CompletionRequestSettings + Send + Sync>;

/// Rewrites a prompt before it reaches a connector.
#[derive(Clone)]
pub enum PromptTransform {
    /// Text with a `{prompt}` placeholder, e.g. `"[INST] {prompt} [/INST]"`.
    Template(String),
    Function(Arc<dyn Fn(&str) -> String + Send + Sync>),
}

impl PromptTransform {
    pub fn template(template: impl Into<String>) -> Self {
        Self::Template(template.into())
    }

    pub fn function<F>(f: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        Self::Function(Arc::new(f))
    }

    pub fn apply(&self, prompt: &str) -> String {
        match self {
            Self::Template(template) => template.replace(PROMPT_PLACEHOLDER, prompt),
            Self::Function(f) => f(prompt),
        }
    }
}

impl fmt::Debug for PromptTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Template(template) => f.debug_tuple("Template").field(template).finish(),
            Self::Function(_) => f.write_str("Function(..)"),
        }
    }
}

/// Temperature transform that clamps into `[min, max]`.
///
/// Reversed bounds are swapped. A NaN bound is ignored on its side.
pub fn clamp_temperature(min: f32, max: f32) -> TemperatureTransformFn {
    let (lo, hi) = if min > max { (max, min) } else { (min, max) };
    Arc::new(move |t| t.max(lo).min(hi))
}

/// Rough token count (one token per four characters, rounded up).
///
/// Good enough for budgeting when no real tokenizer is wired in.
pub fn approximate_token_count(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_replaces_every_placeholder() {
        let t = PromptTransform::template("<s>{prompt}</s> echo: {prompt}");
        assert_eq!(t.apply("hi"), "<s>hi</s> echo: hi");
    }

    #[test]
    fn function_transform_applies() {
        let t = PromptTransform::function(|p| p.to_uppercase());
        assert_eq!(t.apply("shout"), "SHOUT");
        assert_eq!(format!("{t:?}"), "Function(..)");
    }

    #[test]
    fn clamp_keeps_temperature_in_range() {
        let clamp = clamp_temperature(0.1, 1.0);
        assert_eq!(clamp(0.0), 0.1);
        assert_eq!(clamp(0.5), 0.5);
        assert_eq!(clamp(2.0), 1.0);
    }

    #[test]
    fn clamp_never_panics_on_odd_bounds() {
        let reversed = clamp_temperature(1.0, 0.5);
        assert_eq!(reversed(0.0), 0.5);
        assert_eq!(reversed(2.0), 1.0);

        let nan_min = clamp_temperature(f32::NAN, 1.0);
        assert_eq!(nan_min(0.5), 0.5);
        assert_eq!(nan_min(1.5), 1.0);
    }

    #[test]
    fn approximate_count_rounds_up() {
        assert_eq!(approximate_token_count(""), 0);
        assert_eq!(approximate_token_count("abc"), 1);
        assert_eq!(approximate_token_count("abcdefgh"), 2);
        assert_eq!(approximate_token_count("abcdefghi"), 3);
    }
}
