//! Named connectors: one backend provider plus its adjustment and cost policy.

use std::fmt;
use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::llm::{CompletionRequestSettings, TextCompletion};
use crate::multi_connector::settings::MultiTextCompletionSettings;
use crate::multi_connector::shape::PromptConnectorSettings;
use crate::multi_connector::transform::{
    PromptTransform, SettingsTransformFn, TemperatureTransformFn, TokenCountFn,
};

/// Default share of a connector's token ceiling handed to the completion.
pub const DEFAULT_MAX_TOKENS_RESERVE_PERCENTAGE: u32 = 80;

/// How a connector's `max_tokens` ceiling limits the requested completion length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaxTokensAdjustment {
    /// Cap at `ceiling * reserve_percentage / 100`.
    #[default]
    Percentage,
    /// Cap at `ceiling - tokens(prompt)`. Requires a token counter.
    CountInputTokens,
}

/// A backend provider registered with the router under a unique name.
///
/// Built once with the `with_*` methods and then shared immutably.
#[derive(Clone)]
pub struct NamedTextCompletion {
    name: String,
    provider: Arc<dyn TextCompletion>,
    max_tokens: Option<u32>,
    max_tokens_adjustment: MaxTokensAdjustment,
    max_tokens_reserve_percentage: u32,
    prompt_transform: Option<PromptTransform>,
    temperature_transform: Option<TemperatureTransformFn>,
    request_settings_transform: Option<SettingsTransformFn>,
    cost_per_request: Decimal,
    cost_per_1000_tokens: Option<Decimal>,
    token_count: Option<TokenCountFn>,
}

impl NamedTextCompletion {
    pub fn new(name: impl Into<String>, provider: Arc<dyn TextCompletion>) -> Self {
        Self {
            name: name.into(),
            provider,
            max_tokens: None,
            max_tokens_adjustment: MaxTokensAdjustment::default(),
            max_tokens_reserve_percentage: DEFAULT_MAX_TOKENS_RESERVE_PERCENTAGE,
            prompt_transform: None,
            temperature_transform: None,
            request_settings_transform: None,
            cost_per_request: Decimal::ZERO,
            cost_per_1000_tokens: None,
            token_count: None,
        }
    }

    /// Token ceiling of the underlying model.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_max_tokens_adjustment(mut self, policy: MaxTokensAdjustment) -> Self {
        self.max_tokens_adjustment = policy;
        self
    }

    pub fn with_max_tokens_reserve_percentage(mut self, percentage: u32) -> Self {
        self.max_tokens_reserve_percentage = percentage;
        self
    }

    pub fn with_prompt_transform(mut self, transform: PromptTransform) -> Self {
        self.prompt_transform = Some(transform);
        self
    }

    pub fn with_temperature_transform(mut self, transform: TemperatureTransformFn) -> Self {
        self.temperature_transform = Some(transform);
        self
    }

    pub fn with_request_settings_transform(mut self, transform: SettingsTransformFn) -> Self {
        self.request_settings_transform = Some(transform);
        self
    }

    pub fn with_cost_per_request(mut self, cost: Decimal) -> Self {
        self.cost_per_request = cost;
        self
    }

    pub fn with_cost_per_1000_tokens(mut self, cost: Decimal) -> Self {
        self.cost_per_1000_tokens = Some(cost);
        self
    }

    pub fn with_token_count(mut self, counter: TokenCountFn) -> Self {
        self.token_count = Some(counter);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn provider(&self) -> &Arc<dyn TextCompletion> {
        &self.provider
    }

    pub fn max_tokens(&self) -> Option<u32> {
        self.max_tokens
    }

    pub fn max_tokens_adjustment(&self) -> MaxTokensAdjustment {
        self.max_tokens_adjustment
    }

    pub fn max_tokens_reserve_percentage(&self) -> u32 {
        self.max_tokens_reserve_percentage
    }

    pub fn cost_per_request(&self) -> Decimal {
        self.cost_per_request
    }

    pub fn cost_per_1000_tokens(&self) -> Option<Decimal> {
        self.cost_per_1000_tokens
    }

    fn count_tokens(&self, text: &str) -> Option<usize> {
        self.token_count.as_ref().map(|count| count(text))
    }

    /// Adapt a prompt and its settings for this connector.
    ///
    /// Steps run in a fixed order: token budget, temperature, full settings
    /// override, then prompt transforms (global, shape, and connector when the
    /// shape allows it). Inputs are never modified.
    pub fn adjust_prompt_and_request_settings(
        &self,
        prompt: &str,
        settings: &CompletionRequestSettings,
        prompt_settings: Option<&PromptConnectorSettings>,
        global: &MultiTextCompletionSettings,
    ) -> (String, CompletionRequestSettings) {
        let mut adjusted = settings.clone();

        if let (Some(ceiling), Some(requested)) = (self.max_tokens, settings.max_tokens) {
            match self.max_tokens_adjustment {
                MaxTokensAdjustment::Percentage => {
                    let cap = (u64::from(ceiling) * u64::from(self.max_tokens_reserve_percentage)
                        / 100) as u32;
                    adjusted.max_tokens = Some(requested.min(cap));
                }
                MaxTokensAdjustment::CountInputTokens => match self.count_tokens(prompt) {
                    Some(input_tokens) => {
                        let input_tokens = u32::try_from(input_tokens).unwrap_or(u32::MAX);
                        let cap = ceiling.saturating_sub(input_tokens);
                        adjusted.max_tokens = Some(requested.min(cap));
                    }
                    None => {
                        tracing::warn!(
                            connector = %self.name,
                            "CountInputTokens adjustment requires a token counter; leaving max_tokens unchanged"
                        );
                    }
                },
            }
        }

        if let (Some(transform), Some(temperature)) =
            (&self.temperature_transform, settings.temperature)
        {
            adjusted.temperature = Some(transform(temperature));
        }

        if let Some(transform) = &self.request_settings_transform {
            adjusted = transform(settings);
        }

        let mut text = match &global.global_prompt_transform {
            Some(transform) => transform.apply(prompt),
            None => prompt.to_string(),
        };
        if let Some(shape) = prompt_settings {
            if let Some(transform) = shape.prompt_type_transform() {
                text = transform.apply(&text);
            }
            if shape.apply_model_transform() {
                if let Some(transform) = &self.prompt_transform {
                    text = transform.apply(&text);
                }
            }
        }

        (text, adjusted)
    }

    /// Monetary cost of one call.
    ///
    /// `cost_per_request + cost_per_1000_tokens * tokens(prompt + result) / 1000`,
    /// with a zero token count when no counter is configured.
    pub fn get_cost(&self, prompt: &str, result: &str) -> Decimal {
        let per_thousand = self.cost_per_1000_tokens.unwrap_or(Decimal::ZERO);
        let tokens = self
            .count_tokens(&format!("{prompt}{result}"))
            .unwrap_or(0);
        self.cost_per_request + per_thousand * Decimal::from(tokens) / dec!(1000)
    }
}

impl fmt::Debug for NamedTextCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedTextCompletion")
            .field("name", &self.name)
            .field("model", &self.provider.model_name())
            .field("max_tokens", &self.max_tokens)
            .field("max_tokens_adjustment", &self.max_tokens_adjustment)
            .field(
                "max_tokens_reserve_percentage",
                &self.max_tokens_reserve_percentage,
            )
            .field("prompt_transform", &self.prompt_transform)
            .field("cost_per_request", &self.cost_per_request)
            .field("cost_per_1000_tokens", &self.cost_per_1000_tokens)
            .finish_non_exhaustive()
    }
}
