//! Prompt shapes and the per-shape routing state.
//!
//! Every distinct prompt shape gets one [`PromptConnectorSettings`]. Two
//! writers touch it concurrently and never the same field:
//!
//! - the router counts samples per connector (`test_counts`),
//! - the analysis task replaces the whole [`ShapeSelection`] snapshot.
//!
//! Readers on the request path clone the snapshot `Arc` and may observe a
//! selection that changes right after; routing is eventually consistent.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::multi_connector::analysis::ConnectorEvaluation;
use crate::multi_connector::comparer::{ConnectorCandidate, ConnectorComparer};
use crate::multi_connector::connector::NamedTextCompletion;
use crate::multi_connector::job::{ConnectorTest, duration_millis};
use crate::multi_connector::transform::PromptTransform;

/// Classification key for a family of prompts: the text they start with.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PromptSignature {
    prompt_start: String,
}

impl PromptSignature {
    pub fn new(prompt_start: impl Into<String>) -> Self {
        Self {
            prompt_start: prompt_start.into(),
        }
    }

    /// Signature made of the first `truncation_length` characters of `prompt`.
    pub fn from_prompt(prompt: &str, truncation_length: usize) -> Self {
        Self::new(prompt.chars().take(truncation_length).collect::<String>())
    }

    pub fn prompt_start(&self) -> &str {
        &self.prompt_start
    }

    pub fn matches(&self, prompt: &str) -> bool {
        prompt.starts_with(&self.prompt_start)
    }
}

impl fmt::Display for PromptSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.prompt_start)
    }
}

/// How far a connector is trusted for a prompt shape.
///
/// Ordered from least to most trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VettingLevel {
    /// Failed at least one evaluation.
    Invalid,
    /// Not enough evaluations yet.
    #[default]
    None,
    /// Passed enough evaluations to be routed to.
    Vetted,
    /// The main connector; reference for vetting the others.
    Oracle,
}

/// What analysis has learned about one connector on one prompt shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectorPerformance {
    pub vetting_level: VettingLevel,
    /// Samples or evaluations folded into the averages.
    pub evaluation_count: u32,
    /// Evaluations the connector passed.
    pub passed_count: u32,
    pub average_cost: Decimal,
    #[serde(with = "duration_millis")]
    pub average_duration: Duration,
}

impl ConnectorPerformance {
    /// Fold one observation into the running averages.
    pub fn record(&mut self, cost: Decimal, duration: Duration) {
        let n = self.evaluation_count;
        let next = n + 1;
        self.average_cost =
            (self.average_cost * Decimal::from(n) + cost) / Decimal::from(next);
        self.average_duration = (self.average_duration * n + duration) / next;
        self.evaluation_count = next;
    }
}

/// Snapshot of a shape's routing decision, replaced as a whole by analysis.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShapeSelection {
    /// Connector requests of this shape go to. `None` means the main connector.
    pub selected_connector: Option<String>,
    pub performances: BTreeMap<String, ConnectorPerformance>,
}

impl ShapeSelection {
    /// Build the next snapshot from this one plus new samples and evaluations.
    ///
    /// Samples come from the main connector and feed its oracle averages.
    /// Each evaluation moves a secondary connector towards `Vetted` (after
    /// `vetting_threshold` passes) or marks it `Invalid` on the first failure.
    pub(crate) fn updated(
        &self,
        connectors: &[Arc<NamedTextCompletion>],
        samples: &[&ConnectorTest],
        evaluations: &[&ConnectorEvaluation],
        vetting_threshold: u32,
        comparer: &dyn ConnectorComparer,
    ) -> ShapeSelection {
        let mut next = self.clone();
        let Some(main) = connectors.first() else {
            return next;
        };

        for sample in samples {
            let perf = next
                .performances
                .entry(sample.connector_name.clone())
                .or_default();
            perf.vetting_level = VettingLevel::Oracle;
            perf.record(sample.cost, sample.duration);
        }

        for evaluation in evaluations {
            let perf = next
                .performances
                .entry(evaluation.test.connector_name.clone())
                .or_default();
            perf.record(evaluation.test.cost, evaluation.test.duration);
            if evaluation.is_vetted {
                perf.passed_count += 1;
            }
            perf.vetting_level = if !evaluation.is_vetted || perf.vetting_level == VettingLevel::Invalid {
                VettingLevel::Invalid
            } else if perf.passed_count >= vetting_threshold {
                VettingLevel::Vetted
            } else {
                VettingLevel::None
            };
        }

        let main_default = ConnectorPerformance {
            vetting_level: VettingLevel::Oracle,
            ..Default::default()
        };
        let best = connectors
            .iter()
            .filter_map(|c| {
                let is_main = Arc::ptr_eq(c, main);
                let performance = match next.performances.get(c.name()) {
                    Some(p) => p,
                    None if is_main => &main_default,
                    None => return None,
                };
                Some(ConnectorCandidate {
                    name: c.name(),
                    is_main,
                    performance,
                })
            })
            .min_by(|a, b| comparer.compare(a, b))
            .map(|c| c.name.to_string());

        next.selected_connector = best.filter(|name| name != main.name());
        next
    }
}

/// A prompt shape declared up front, with optional transforms.
#[derive(Debug, Clone)]
pub struct PromptShapeSettings {
    pub signature: PromptSignature,
    pub prompt_type_transform: Option<PromptTransform>,
    pub apply_model_transform: bool,
}

impl PromptShapeSettings {
    pub fn new(signature: PromptSignature) -> Self {
        Self {
            signature,
            prompt_type_transform: None,
            apply_model_transform: true,
        }
    }
}

/// Routing state for one prompt shape.
#[derive(Debug)]
pub struct PromptConnectorSettings {
    signature: PromptSignature,
    prompt_type_transform: Option<PromptTransform>,
    apply_model_transform: bool,
    selection: RwLock<Arc<ShapeSelection>>,
    /// Samples reserved per connector. Written only by the router.
    test_counts: Mutex<HashMap<String, u32>>,
}

impl PromptConnectorSettings {
    pub fn new(signature: PromptSignature) -> Self {
        Self {
            signature,
            prompt_type_transform: None,
            apply_model_transform: true,
            selection: RwLock::new(Arc::new(ShapeSelection::default())),
            test_counts: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_shape_settings(shape: &PromptShapeSettings) -> Self {
        let mut settings = Self::new(shape.signature.clone());
        settings.prompt_type_transform = shape.prompt_type_transform.clone();
        settings.apply_model_transform = shape.apply_model_transform;
        settings
    }

    pub fn with_prompt_type_transform(mut self, transform: PromptTransform) -> Self {
        self.prompt_type_transform = Some(transform);
        self
    }

    pub fn with_apply_model_transform(mut self, apply: bool) -> Self {
        self.apply_model_transform = apply;
        self
    }

    pub fn signature(&self) -> &PromptSignature {
        &self.signature
    }

    pub fn prompt_type_transform(&self) -> Option<&PromptTransform> {
        self.prompt_type_transform.as_ref()
    }

    pub fn apply_model_transform(&self) -> bool {
        self.apply_model_transform
    }

    /// Current routing snapshot.
    pub fn selection(&self) -> Arc<ShapeSelection> {
        Arc::clone(&self.selection.read().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn selected_connector_name(&self) -> Option<String> {
        self.selection().selected_connector.clone()
    }

    /// Swap in a new snapshot. Only the analysis task calls this.
    pub(crate) fn replace_selection(&self, selection: ShapeSelection) {
        *self.selection.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(selection);
    }

    /// Pick the connector for this shape from the registered roster.
    ///
    /// Falls back to the main connector when nothing has been selected yet or
    /// the selected name is no longer registered.
    pub fn select_connector<'a>(
        &self,
        connectors: &'a [Arc<NamedTextCompletion>],
    ) -> Option<&'a Arc<NamedTextCompletion>> {
        let selection = self.selection();
        selection
            .selected_connector
            .as_deref()
            .and_then(|name| connectors.iter().find(|c| c.name() == name))
            .or_else(|| connectors.first())
    }

    /// Samples counted so far for `connector`.
    pub fn test_count(&self, connector: &str) -> u32 {
        self.test_counts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(connector)
            .copied()
            .unwrap_or(0)
    }

    /// Count a sample for `connector` if fewer than `limit` have been taken.
    ///
    /// Check and increment happen under one lock so concurrent requests never
    /// overshoot the limit.
    pub(crate) fn try_reserve_sample(&self, connector: &str, limit: u32) -> bool {
        let mut counts = self.test_counts.lock().unwrap_or_else(|e| e.into_inner());
        let count = counts.entry(connector.to_string()).or_insert(0);
        if *count >= limit {
            return false;
        }
        *count += 1;
        true
    }

    /// Give back a slot taken by [`try_reserve_sample`](Self::try_reserve_sample)
    /// for a sample that was never evaluated.
    pub(crate) fn release_sample(&self, connector: &str) {
        let mut counts = self.test_counts.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(count) = counts.get_mut(connector) {
            *count = count.saturating_sub(1);
        }
    }

    pub(crate) fn test_counts(&self) -> BTreeMap<String, u32> {
        self.test_counts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }
}
