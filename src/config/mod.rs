//! Configuration for the multi-connector router.
//!
//! Loaded from a TOML file, then overridden by environment variables (a
//! `.env` file is honored). Providers are not configured here: callers pair
//! each `[[connectors]]` entry with a provider by name.
//!
//! ```toml
//! prompt_truncation_length = 20
//!
//! [analysis]
//! enabled = true
//! delay_ms = 1000
//! samples_per_shape = 3
//!
//! [[connectors]]
//! name = "gpt-4o"
//! max_tokens = 4096
//!
//! [[connectors]]
//! name = "local"
//! model = "llama3"
//! prompt_template = "[INST] {prompt} [/INST]"
//! temperature_range = [0.1, 1.0]
//! ```

mod connector;
pub(crate) mod helpers;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

pub use self::connector::{ConnectorConfig, PromptShapeConfig};
use self::helpers::{optional_env, parse_bool_env, parse_optional_env};
use crate::error::ConfigError;
use crate::llm::{CostCreditor, TextCompletion};
use crate::multi_connector::comparer::WeightedCostPerformanceComparer;
use crate::multi_connector::connector::NamedTextCompletion;
use crate::multi_connector::evaluator::DEFAULT_VETTING_PROMPT_TEMPLATE;
use crate::multi_connector::router::MultiTextCompletion;
use crate::multi_connector::settings::{
    AnalysisSettings, DEFAULT_ANALYSIS_DELAY, DEFAULT_PROMPT_TRUNCATION_LENGTH,
    DEFAULT_SAMPLES_PER_SHAPE, MultiTextCompletionSettings,
};
use crate::multi_connector::transform::PromptTransform;
use crate::observability::{LogFormat, LogObserver};

/// `[analysis]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub enabled: bool,
    pub delay_ms: u64,
    pub samples_per_shape: u32,
    pub vetting_prompt_template: Option<String>,
    pub analysis_file: Option<PathBuf>,
    pub update_routing: bool,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            delay_ms: DEFAULT_ANALYSIS_DELAY.as_millis() as u64,
            samples_per_shape: DEFAULT_SAMPLES_PER_SHAPE,
            vetting_prompt_template: None,
            analysis_file: None,
            update_routing: true,
        }
    }
}

/// `[comparer]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComparerConfig {
    pub cost_weight: f64,
    pub duration_weight: f64,
}

impl Default for ComparerConfig {
    fn default() -> Self {
        let d = WeightedCostPerformanceComparer::default();
        Self {
            cost_weight: d.cost_weight,
            duration_weight: d.duration_weight,
        }
    }
}

/// Whole router configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiConnectorConfig {
    pub prompt_truncation_length: usize,
    pub freeze_prompt_shapes: bool,
    /// Template with a `{prompt}` placeholder applied to every prompt.
    pub global_prompt_template: Option<String>,
    pub log_format: LogFormat,
    /// Keep a running total of request costs.
    pub track_costs: bool,
    pub analysis: AnalysisConfig,
    pub comparer: ComparerConfig,
    pub connectors: Vec<ConnectorConfig>,
    pub prompt_shapes: Vec<PromptShapeConfig>,
}

impl Default for MultiConnectorConfig {
    fn default() -> Self {
        Self {
            prompt_truncation_length: DEFAULT_PROMPT_TRUNCATION_LENGTH,
            freeze_prompt_shapes: false,
            global_prompt_template: None,
            log_format: LogFormat::default(),
            track_costs: true,
            analysis: AnalysisConfig::default(),
            comparer: ComparerConfig::default(),
            connectors: Vec::new(),
            prompt_shapes: Vec::new(),
        }
    }
}

impl MultiConnectorConfig {
    /// Load a TOML file, apply env overrides and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let raw = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&raw)?;
        config.apply_env_overrides()?;
        config.validate()?;
        tracing::debug!(
            path = %path.display(),
            connectors = config.connectors.len(),
            "Loaded multi-connector configuration"
        );
        Ok(config)
    }

    /// Parse TOML without env overrides or validation.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Override values from `MULTI_CONNECTOR_*` env vars.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.analysis.enabled =
            parse_bool_env("MULTI_CONNECTOR_ANALYSIS_ENABLED", self.analysis.enabled)?;
        self.analysis.delay_ms =
            parse_optional_env("MULTI_CONNECTOR_ANALYSIS_DELAY_MS", self.analysis.delay_ms)?;
        self.analysis.samples_per_shape = parse_optional_env(
            "MULTI_CONNECTOR_SAMPLES_PER_SHAPE",
            self.analysis.samples_per_shape,
        )?;
        self.prompt_truncation_length = parse_optional_env(
            "MULTI_CONNECTOR_PROMPT_TRUNCATION",
            self.prompt_truncation_length,
        )?;
        if let Some(path) = optional_env("MULTI_CONNECTOR_ANALYSIS_FILE")? {
            self.analysis.analysis_file = Some(PathBuf::from(path));
        }
        self.log_format = parse_optional_env("MULTI_CONNECTOR_LOG_FORMAT", self.log_format)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connectors.is_empty() {
            return Err(ConfigError::NoConnectors);
        }
        let mut names = HashSet::new();
        for connector in &self.connectors {
            connector.validate()?;
            if !names.insert(connector.name.as_str()) {
                return Err(ConfigError::DuplicateConnector {
                    name: connector.name.clone(),
                });
            }
        }
        if self.prompt_truncation_length == 0 {
            return Err(ConfigError::InvalidValue {
                key: "prompt_truncation_length".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        for (key, weight) in [
            ("comparer.cost_weight", self.comparer.cost_weight),
            ("comparer.duration_weight", self.comparer.duration_weight),
        ] {
            if !weight.is_finite() || weight < 0.0 {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: format!("{weight} must be a finite non-negative number"),
                });
            }
        }
        Ok(())
    }

    /// Router settings described by this config.
    pub fn to_settings(&self) -> MultiTextCompletionSettings {
        MultiTextCompletionSettings {
            prompt_shapes: self.prompt_shapes.iter().map(|s| s.to_settings()).collect(),
            comparer: Arc::new(WeightedCostPerformanceComparer::new(
                self.comparer.cost_weight,
                self.comparer.duration_weight,
            )),
            analysis: AnalysisSettings {
                enabled: self.analysis.enabled,
                analysis_delay: Duration::from_millis(self.analysis.delay_ms),
                samples_per_shape: self.analysis.samples_per_shape,
                vetting_prompt_template: self
                    .analysis
                    .vetting_prompt_template
                    .clone()
                    .unwrap_or_else(|| DEFAULT_VETTING_PROMPT_TEMPLATE.to_string()),
                analysis_file: self.analysis.analysis_file.clone(),
                update_routing: self.analysis.update_routing,
            },
            global_prompt_transform: self
                .global_prompt_template
                .clone()
                .map(PromptTransform::Template),
            creditor: self.track_costs.then(|| Arc::new(CostCreditor::new())),
            prompt_truncation_length: self.prompt_truncation_length,
            freeze_prompt_shapes: self.freeze_prompt_shapes,
            observers: vec![Arc::new(LogObserver)],
            ..Default::default()
        }
    }

    /// Pair every configured connector with its provider, in config order.
    pub fn build_connectors(
        &self,
        providers: &HashMap<String, Arc<dyn TextCompletion>>,
    ) -> Result<Vec<NamedTextCompletion>, ConfigError> {
        self.connectors
            .iter()
            .map(|c| {
                providers
                    .get(&c.name)
                    .map(|p| c.build(Arc::clone(p)))
                    .ok_or_else(|| ConfigError::MissingProvider {
                        name: c.name.clone(),
                    })
            })
            .collect()
    }

    /// Build a ready router. Must run inside a Tokio runtime when analysis is
    /// enabled.
    pub fn build_router(
        &self,
        providers: &HashMap<String, Arc<dyn TextCompletion>>,
        cancel: &CancellationToken,
    ) -> Result<MultiTextCompletion, ConfigError> {
        self.validate()?;
        let connectors = self.build_connectors(providers)?;
        MultiTextCompletion::new(self.to_settings(), connectors, cancel)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::config::helpers::ENV_LOCK;
    use crate::testing::StubCompletion;

    const SAMPLE: &str = r#"
        prompt_truncation_length = 12
        global_prompt_template = "System: be brief.\n{prompt}"

        [analysis]
        enabled = true
        delay_ms = 250
        samples_per_shape = 5

        [comparer]
        duration_weight = 0.0

        [[connectors]]
        name = "main"
        max_tokens = 4096
        cost_per_1000_tokens = 0.02

        [[connectors]]
        name = "local"
        model = "llama3"
        max_tokens_adjustment = "count_input_tokens"
        prompt_template = "[INST] {prompt} [/INST]"
        temperature_range = [0.1, 1.0]

        [[prompt_shapes]]
        prompt_start = "Translate"
        template = "Translate carefully. {prompt}"
    "#;

    fn clear_env() {
        for key in [
            "MULTI_CONNECTOR_ANALYSIS_ENABLED",
            "MULTI_CONNECTOR_ANALYSIS_DELAY_MS",
            "MULTI_CONNECTOR_SAMPLES_PER_SHAPE",
            "MULTI_CONNECTOR_PROMPT_TRUNCATION",
            "MULTI_CONNECTOR_ANALYSIS_FILE",
            "MULTI_CONNECTOR_LOG_FORMAT",
        ] {
            unsafe { std::env::remove_var(key) };
        }
    }

    #[test]
    fn parses_full_document() {
        let cfg = MultiConnectorConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(cfg.prompt_truncation_length, 12);
        assert_eq!(cfg.analysis.delay_ms, 250);
        assert_eq!(cfg.analysis.samples_per_shape, 5);
        assert_eq!(cfg.comparer.duration_weight, 0.0);
        assert_eq!(cfg.comparer.cost_weight, 1.0);
        assert_eq!(cfg.connectors.len(), 2);
        assert_eq!(cfg.connectors[0].cost_per_1000_tokens, Some(dec!(0.02)));
        assert_eq!(cfg.connectors[1].temperature_range, Some((0.1, 1.0)));
        assert_eq!(cfg.prompt_shapes[0].prompt_start, "Translate");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn empty_document_fails_validation() {
        let cfg = MultiConnectorConfig::from_toml_str("").unwrap();
        assert!(matches!(cfg.validate(), Err(ConfigError::NoConnectors)));
    }

    #[test]
    fn duplicate_connector_is_rejected() {
        let mut cfg = MultiConnectorConfig::from_toml_str(SAMPLE).unwrap();
        cfg.connectors[1].name = "main".to_string();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::DuplicateConnector { ref name }) if name == "main"
        ));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let err = MultiConnectorConfig::from_toml_str("connectors = 3").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn env_overrides_file_values() {
        let _lock = ENV_LOCK.lock();
        clear_env();
        unsafe {
            std::env::set_var("MULTI_CONNECTOR_ANALYSIS_ENABLED", "false");
            std::env::set_var("MULTI_CONNECTOR_ANALYSIS_DELAY_MS", "5");
            std::env::set_var("MULTI_CONNECTOR_LOG_FORMAT", "json");
            std::env::set_var("MULTI_CONNECTOR_ANALYSIS_FILE", "/tmp/analysis.json");
        }

        let mut cfg = MultiConnectorConfig::from_toml_str(SAMPLE).unwrap();
        cfg.apply_env_overrides().unwrap();
        clear_env();

        assert!(!cfg.analysis.enabled);
        assert_eq!(cfg.analysis.delay_ms, 5);
        assert_eq!(cfg.analysis.samples_per_shape, 5);
        assert_eq!(cfg.log_format, LogFormat::Json);
        assert_eq!(
            cfg.analysis.analysis_file,
            Some(PathBuf::from("/tmp/analysis.json"))
        );
    }

    #[test]
    fn invalid_env_value_is_reported() {
        let _lock = ENV_LOCK.lock();
        clear_env();
        unsafe { std::env::set_var("MULTI_CONNECTOR_SAMPLES_PER_SHAPE", "lots") };
        let mut cfg = MultiConnectorConfig::default();
        let err = cfg.apply_env_overrides().unwrap_err();
        clear_env();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "MULTI_CONNECTOR_SAMPLES_PER_SHAPE"));
    }

    #[test]
    fn settings_mirror_config() {
        let cfg = MultiConnectorConfig::from_toml_str(SAMPLE).unwrap();
        let settings = cfg.to_settings();
        assert_eq!(settings.prompt_truncation_length, 12);
        assert_eq!(settings.analysis.analysis_delay, Duration::from_millis(250));
        assert_eq!(settings.prompt_shapes.len(), 1);
        assert!(settings.creditor.is_some());
        assert_eq!(
            settings.global_prompt_transform.unwrap().apply("hi"),
            "System: be brief.\nhi"
        );
    }

    #[test]
    fn missing_provider_is_reported() {
        let cfg = MultiConnectorConfig::from_toml_str(SAMPLE).unwrap();
        let mut providers: HashMap<String, Arc<dyn TextCompletion>> = HashMap::new();
        providers.insert("main".to_string(), Arc::new(StubCompletion::new("x")));
        let err = cfg.build_connectors(&providers).unwrap_err();
        assert!(matches!(err, ConfigError::MissingProvider { ref name } if name == "local"));
    }

    #[tokio::test]
    async fn builds_router_in_config_order() {
        let cfg = MultiConnectorConfig::from_toml_str(SAMPLE).unwrap();
        let mut providers: HashMap<String, Arc<dyn TextCompletion>> = HashMap::new();
        providers.insert("local".to_string(), Arc::new(StubCompletion::new("b")));
        providers.insert("main".to_string(), Arc::new(StubCompletion::new("a")));

        let router = cfg
            .build_router(&providers, &CancellationToken::new())
            .unwrap();
        let names: Vec<_> = router.connectors().iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["main", "local"]);
        assert_eq!(router.connectors()[1].max_tokens_reserve_percentage(), 80);
        router.shutdown().await.unwrap();
    }

    #[test]
    fn toml_round_trip() {
        let cfg = MultiConnectorConfig::from_toml_str(SAMPLE).unwrap();
        let text = cfg.to_toml_string().unwrap();
        let back = MultiConnectorConfig::from_toml_str(&text).unwrap();
        assert_eq!(cfg, back);
    }
}
