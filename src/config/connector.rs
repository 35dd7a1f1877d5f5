//! Per-connector and per-shape configuration entries.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::llm::TextCompletion;
use crate::llm::costs::model_cost_per_1000_tokens;
use crate::multi_connector::connector::{
    DEFAULT_MAX_TOKENS_RESERVE_PERCENTAGE, MaxTokensAdjustment, NamedTextCompletion,
};
use crate::multi_connector::shape::{PromptShapeSettings, PromptSignature};
use crate::multi_connector::transform::{
    PromptTransform, approximate_token_count, clamp_temperature,
};

fn default_reserve_percentage() -> u32 {
    DEFAULT_MAX_TOKENS_RESERVE_PERCENTAGE
}

fn default_true() -> bool {
    true
}

/// One `[[connectors]]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorConfig {
    /// Unique connector name; also the key used to look up its provider.
    pub name: String,
    /// Model id used for the built-in price lookup. Defaults to the
    /// provider's own model name.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub max_tokens_adjustment: MaxTokensAdjustment,
    #[serde(default = "default_reserve_percentage")]
    pub max_tokens_reserve_percentage: u32,
    #[serde(default)]
    pub cost_per_request: Option<Decimal>,
    #[serde(default)]
    pub cost_per_1000_tokens: Option<Decimal>,
    /// Template with a `{prompt}` placeholder.
    #[serde(default)]
    pub prompt_template: Option<String>,
    /// `[min, max]` the requested temperature is clamped into.
    #[serde(default)]
    pub temperature_range: Option<(f32, f32)>,
    /// Count tokens with the built-in approximation (needed for per-token
    /// costs and `count_input_tokens`).
    #[serde(default = "default_true")]
    pub approximate_tokens: bool,
}

impl ConnectorConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model: None,
            max_tokens: None,
            max_tokens_adjustment: MaxTokensAdjustment::default(),
            max_tokens_reserve_percentage: DEFAULT_MAX_TOKENS_RESERVE_PERCENTAGE,
            cost_per_request: None,
            cost_per_1000_tokens: None,
            prompt_template: None,
            temperature_range: None,
            approximate_tokens: true,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "connectors.name".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        if !(1..=100).contains(&self.max_tokens_reserve_percentage) {
            return Err(ConfigError::InvalidValue {
                key: format!("connectors.{}.max_tokens_reserve_percentage", self.name),
                message: format!(
                    "{} is outside 1..=100",
                    self.max_tokens_reserve_percentage
                ),
            });
        }
        if let Some((min, max)) = self.temperature_range {
            if !min.is_finite() || !max.is_finite() {
                return Err(ConfigError::InvalidValue {
                    key: format!("connectors.{}.temperature_range", self.name),
                    message: format!("bounds [{min}, {max}] must be finite"),
                });
            }
            if min > max {
                return Err(ConfigError::InvalidValue {
                    key: format!("connectors.{}.temperature_range", self.name),
                    message: format!("min {min} is greater than max {max}"),
                });
            }
        }
        if let Some(cost) = self
            .cost_per_request
            .into_iter()
            .chain(self.cost_per_1000_tokens)
            .find(|c| c.is_sign_negative())
        {
            return Err(ConfigError::InvalidValue {
                key: format!("connectors.{}.cost", self.name),
                message: format!("{cost} is negative"),
            });
        }
        Ok(())
    }

    /// Pair this entry with its provider.
    pub fn build(&self, provider: Arc<dyn TextCompletion>) -> NamedTextCompletion {
        let model = self
            .model
            .clone()
            .unwrap_or_else(|| provider.model_name().to_string());
        let per_thousand = self.cost_per_1000_tokens.or_else(|| {
            let cost = model_cost_per_1000_tokens(&model);
            if cost.is_none() {
                tracing::debug!(
                    connector = %self.name,
                    model = %model,
                    "No known price for model; per-token cost is zero"
                );
            }
            cost
        });

        let mut connector = NamedTextCompletion::new(self.name.clone(), provider)
            .with_max_tokens_adjustment(self.max_tokens_adjustment)
            .with_max_tokens_reserve_percentage(self.max_tokens_reserve_percentage)
            .with_cost_per_request(self.cost_per_request.unwrap_or(Decimal::ZERO));
        if let Some(max_tokens) = self.max_tokens {
            connector = connector.with_max_tokens(max_tokens);
        }
        if let Some(cost) = per_thousand {
            connector = connector.with_cost_per_1000_tokens(cost);
        }
        if let Some(template) = &self.prompt_template {
            connector = connector.with_prompt_transform(PromptTransform::template(template.clone()));
        }
        if let Some((min, max)) = self.temperature_range {
            connector = connector.with_temperature_transform(clamp_temperature(min, max));
        }
        if self.approximate_tokens {
            connector = connector.with_token_count(Arc::new(approximate_token_count));
        }
        connector
    }
}

/// One `[[prompt_shapes]]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptShapeConfig {
    /// Prompts starting with this text belong to the shape.
    pub prompt_start: String,
    /// Template with a `{prompt}` placeholder applied to the shape's prompts.
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default = "default_true")]
    pub apply_model_transform: bool,
}

impl PromptShapeConfig {
    pub(crate) fn to_settings(&self) -> PromptShapeSettings {
        let mut shape = PromptShapeSettings::new(PromptSignature::new(self.prompt_start.clone()));
        shape.prompt_type_transform = self.template.clone().map(PromptTransform::Template);
        shape.apply_model_transform = self.apply_model_transform;
        shape
    }
}
