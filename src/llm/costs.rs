//! Cost accounting for routed completions.
//!
//! Two pieces live here: a per-model price table used to fill in connector
//! pricing that configuration leaves out, and [`CostCreditor`], the shared
//! accumulator the router credits after every completion.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Look up known per-token costs for a model by its identifier.
///
/// Returns `Some((input_cost, output_cost))` for known models, `None` otherwise.
pub fn model_cost(model_id: &str) -> Option<(Decimal, Decimal)> {
    // Normalize: strip provider prefixes (e.g., "openai/gpt-4o" -> "gpt-4o")
    let id = model_id
        .rsplit_once('/')
        .map(|(_, name)| name)
        .unwrap_or(model_id);

    match id {
        // OpenAI models -- prices per token (USD)
        "gpt-4o" | "gpt-4o-2024-11-20" | "gpt-4o-2024-08-06" => {
            Some((dec!(0.0000025), dec!(0.00001)))
        }
        "gpt-4o-mini" | "gpt-4o-mini-2024-07-18" => Some((dec!(0.00000015), dec!(0.0000006))),
        "gpt-4" | "gpt-4-0613" => Some((dec!(0.00003), dec!(0.00006))),
        "gpt-3.5-turbo" | "gpt-3.5-turbo-0125" => Some((dec!(0.0000005), dec!(0.0000015))),
        "gpt-3.5-turbo-instruct" => Some((dec!(0.0000015), dec!(0.000002))),
        "text-davinci-003" => Some((dec!(0.00002), dec!(0.00002))),

        // Anthropic models
        "claude-3-5-sonnet-20241022" | "claude-3-5-sonnet-latest" | "claude-sonnet-4-20250514" => {
            Some((dec!(0.000003), dec!(0.000015)))
        }
        "claude-3-5-haiku-20241022" | "claude-3-5-haiku-latest" => {
            Some((dec!(0.0000008), dec!(0.000004)))
        }
        "claude-3-haiku-20240307" => Some((dec!(0.00000025), dec!(0.00000125))),

        // Ollama / local models -- free
        _ if is_local_model(id) => Some((Decimal::ZERO, Decimal::ZERO)),

        _ => None,
    }
}

/// Blended price per 1000 tokens for a model.
///
/// Connectors are billed on `prompt + result` token counts without telling
/// input and output apart, so the table's two rates are averaged.
pub fn model_cost_per_1000_tokens(model_id: &str) -> Option<Decimal> {
    model_cost(model_id).map(|(input, output)| (input + output) / dec!(2) * dec!(1000))
}

/// Heuristic to detect local/self-hosted models (Ollama, llama.cpp, etc.).
fn is_local_model(model_id: &str) -> bool {
    let lower = model_id.to_lowercase();
    lower.starts_with("llama")
        || lower.starts_with("mistral")
        || lower.starts_with("mixtral")
        || lower.starts_with("phi")
        || lower.starts_with("gemma")
        || lower.starts_with("qwen")
        || lower.starts_with("tinyllama")
        || lower.starts_with("stablelm")
        || lower.contains(":latest")
        || lower.contains(":instruct")
}

/// Accumulates the monetary cost of completions across all requests.
///
/// Shared between concurrent requests; every credit is applied exactly once
/// under a short critical section that is never held across an `.await`.
#[derive(Debug, Default)]
pub struct CostCreditor {
    ongoing_cost: Mutex<Decimal>,
    credits: AtomicU64,
}

impl CostCreditor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `cost` to the running total.
    pub fn credit(&self, cost: Decimal) {
        let mut total = self.ongoing_cost.lock().unwrap_or_else(|e| e.into_inner());
        *total += cost;
        self.credits.fetch_add(1, Ordering::Relaxed);
    }

    /// Total cost credited so far.
    pub fn ongoing_cost(&self) -> Decimal {
        *self.ongoing_cost.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of credits applied so far.
    pub fn credit_count(&self) -> u64 {
        self.credits.load(Ordering::Relaxed)
    }

    /// Reset the total, returning what had been accumulated.
    pub fn reset(&self) -> Decimal {
        let mut total = self.ongoing_cost.lock().unwrap_or_else(|e| e.into_inner());
        self.credits.store(0, Ordering::Relaxed);
        std::mem::take(&mut *total)
    }
}
