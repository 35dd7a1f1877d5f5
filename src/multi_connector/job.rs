//! Completion jobs and the test samples recorded from them.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::llm::CompletionRequestSettings;

/// A prompt together with the settings it was requested with.
///
/// Equality and hashing are structural over both fields, so identical
/// requests collapse to one key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompletionJob {
    pub prompt: String,
    pub settings: CompletionRequestSettings,
}

impl CompletionJob {
    pub fn new(prompt: impl Into<String>, settings: CompletionRequestSettings) -> Self {
        Self {
            prompt: prompt.into(),
            settings,
        }
    }

    /// Stable hex digest of the job, used to correlate persisted tests with
    /// the sample they were derived from.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.prompt.as_bytes());
        hasher.update(b"|");
        // Settings are Serialize, so serde_json gives a deterministic encoding.
        if let Ok(json) = serde_json::to_string(&self.settings) {
            hasher.update(json.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}

/// One observed run of a connector on a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorTest {
    pub job: CompletionJob,
    pub connector_name: String,
    pub result: String,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
    pub cost: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl ConnectorTest {
    pub fn new(
        job: CompletionJob,
        connector_name: impl Into<String>,
        result: impl Into<String>,
        duration: Duration,
        cost: Decimal,
    ) -> Self {
        Self {
            job,
            connector_name: connector_name.into(),
            result: result.into(),
            duration,
            cost,
            timestamp: Utc::now(),
        }
    }
}

pub(crate) mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use rust_decimal_macros::dec;

    use super::*;

    fn job(prompt: &str, temperature: f32) -> CompletionJob {
        CompletionJob::new(
            prompt,
            CompletionRequestSettings::new().with_temperature(temperature),
        )
    }

    #[test]
    fn identical_jobs_deduplicate() {
        let jobs: HashSet<_> = [job("a", 0.1), job("a", 0.1), job("a", 0.2), job("b", 0.1)]
            .into_iter()
            .collect();
        assert_eq!(jobs.len(), 3);
    }

    #[test]
    fn fingerprint_is_deterministic_and_discriminating() {
        let k1 = job("summarize: x", 0.0).fingerprint();
        let k2 = job("summarize: x", 0.0).fingerprint();
        let k3 = job("summarize: x", 1.0).fingerprint();
        assert_eq!(k1, k2);
        assert_eq!(k1.len(), 64);
        assert_ne!(k1, k3);
    }

    #[test]
    fn connector_test_serializes_duration_as_millis() {
        let test = ConnectorTest::new(
            job("p", 0.0),
            "main",
            "answer",
            Duration::from_millis(1500),
            dec!(0.002),
        );
        let value = serde_json::to_value(&test).unwrap();
        assert_eq!(value["duration"], 1500);
        assert_eq!(value["connector_name"], "main");

        let back: ConnectorTest = serde_json::from_value(value).unwrap();
        assert_eq!(back.duration, Duration::from_millis(1500));
        assert_eq!(back.cost, dec!(0.002));
    }
}
