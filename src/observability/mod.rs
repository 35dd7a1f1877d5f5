//! Observability: tracing setup and pluggable analysis observers.
//!
//! | Backend     | Description |
//! |-------------|-------------|
//! | `log`       | Emits structured events via `tracing` |
//! | `recording` | Captures events in memory (tests only) |
//!
//! Observers are registered on
//! [`MultiTextCompletionSettings`](crate::multi_connector::MultiTextCompletionSettings)
//! and called from the analysis task. Completed analyses are also available
//! through `MultiTextCompletion::subscribe`.

mod log;
pub mod traits;

#[cfg(test)]
pub mod recording;

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use crate::error::ConfigError;

pub use self::log::LogObserver;
pub use self::traits::{AnalysisEvent, AnalysisObserver};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "multiconnector=info";

/// Output format of the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::InvalidValue {
                key: "log_format".to_string(),
                message: format!("unknown log format '{other}' (expected pretty, compact or json)"),
            }),
        }
    }
}

/// Install the global tracing subscriber.
///
/// Honors `RUST_LOG`, falling back to [`DEFAULT_LOG_FILTER`]. Returns `false`
/// when a subscriber was already installed, which is harmless.
pub fn init_tracing(format: LogFormat) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let result = match format {
        LogFormat::Json => builder.json().with_current_span(true).try_init(),
        LogFormat::Compact => builder.compact().with_target(false).try_init(),
        LogFormat::Pretty => builder.with_target(false).try_init(),
    };
    result.is_ok()
}
