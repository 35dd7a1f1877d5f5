//! Evaluation of secondary connectors against the main one.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{AnalysisError, LlmError};
use crate::llm::CompletionRequestSettings;
use crate::multi_connector::analysis::ConnectorEvaluation;
use crate::multi_connector::connector::NamedTextCompletion;
use crate::multi_connector::job::ConnectorTest;
use crate::multi_connector::settings::MultiTextCompletionSettings;
use crate::multi_connector::shape::PromptConnectorSettings;
use crate::multi_connector::transform::PROMPT_PLACEHOLDER;

/// Placeholder for the answer under review in vetting templates.
pub const RESULT_PLACEHOLDER: &str = "{result}";

/// Default prompt sent to the main connector to vet an answer.
pub const DEFAULT_VETTING_PROMPT_TEMPLATE: &str = "You are reviewing the answer an assistant gave to an instruction.\n\
\n\
Instruction:\n\
{prompt}\n\
\n\
Answer:\n\
{result}\n\
\n\
Is the answer a correct and complete response to the instruction? Reply with a single word: true or false.";

/// Output of evaluating one sample.
#[derive(Debug, Default)]
pub struct SampleEvaluation {
    /// Runs of secondary connectors on the sample's job.
    pub tests: Vec<ConnectorTest>,
    /// Verdicts on those runs.
    pub evaluations: Vec<ConnectorEvaluation>,
}

/// Scores connectors on a recorded sample.
#[async_trait]
pub trait ConnectorEvaluator: Send + Sync + fmt::Debug {
    /// Evaluate every secondary connector on `sample`.
    ///
    /// `connectors[0]` is the main connector that produced the sample.
    async fn evaluate(
        &self,
        sample: &ConnectorTest,
        shape: &PromptConnectorSettings,
        connectors: &[Arc<NamedTextCompletion>],
        settings: &MultiTextCompletionSettings,
        cancel: &CancellationToken,
    ) -> Result<SampleEvaluation, AnalysisError>;
}

/// Replays a sample on each secondary connector and asks the main connector
/// whether each answer is acceptable.
///
/// A secondary connector that fails to answer is recorded as not vetted.
/// Failure of the main connector while vetting is an error.
#[derive(Debug, Clone)]
pub struct VettingEvaluator {
    /// Token budget for the verdict.
    pub verdict_max_tokens: u32,
}

impl Default for VettingEvaluator {
    fn default() -> Self {
        Self {
            verdict_max_tokens: 16,
        }
    }
}

impl VettingEvaluator {
    fn vetting_prompt(template: &str, prompt: &str, result: &str) -> String {
        template
            .replace(PROMPT_PLACEHOLDER, prompt)
            .replace(RESULT_PLACEHOLDER, result)
    }

    async fn replay(
        connector: &NamedTextCompletion,
        sample: &ConnectorTest,
        shape: &PromptConnectorSettings,
        settings: &MultiTextCompletionSettings,
        cancel: &CancellationToken,
    ) -> Result<ConnectorTest, LlmError> {
        let (prompt, request) = connector.adjust_prompt_and_request_settings(
            &sample.job.prompt,
            &sample.job.settings,
            Some(shape),
            settings,
        );
        let start = Instant::now();
        let results = connector
            .provider()
            .get_completions(&prompt, &request, cancel)
            .await?;
        let duration = start.elapsed();
        let text = results
            .into_iter()
            .next()
            .map(|r| r.content)
            .ok_or_else(|| LlmError::InvalidResponse {
                provider: connector.name().to_string(),
                reason: "no completion returned".to_string(),
            })?;
        let cost = connector.get_cost(&prompt, &text);
        Ok(ConnectorTest::new(
            sample.job.clone(),
            connector.name(),
            text,
            duration,
            cost,
        ))
    }

    async fn vet(
        &self,
        main: &NamedTextCompletion,
        template: &str,
        sample: &ConnectorTest,
        answer: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, AnalysisError> {
        let prompt = Self::vetting_prompt(template, &sample.job.prompt, answer);
        let request = CompletionRequestSettings::new()
            .with_temperature(0.0)
            .with_max_tokens(self.verdict_max_tokens);
        let results = main
            .provider()
            .get_completions(&prompt, &request, cancel)
            .await
            .map_err(|e| {
                if e.is_cancellation() {
                    AnalysisError::Cancelled
                } else {
                    AnalysisError::EvaluationFailed {
                        connector: main.name().to_string(),
                        reason: e.to_string(),
                    }
                }
            })?;
        let verdict = results.first().map(|r| r.content.as_str()).unwrap_or("");
        match parse_verdict(verdict) {
            Some(v) => Ok(v),
            None => {
                tracing::warn!(
                    connector = %main.name(),
                    verdict = %verdict,
                    "Unparseable vetting verdict; treating answer as not vetted"
                );
                Ok(false)
            }
        }
    }
}

#[async_trait]
impl ConnectorEvaluator for VettingEvaluator {
    async fn evaluate(
        &self,
        sample: &ConnectorTest,
        shape: &PromptConnectorSettings,
        connectors: &[Arc<NamedTextCompletion>],
        settings: &MultiTextCompletionSettings,
        cancel: &CancellationToken,
    ) -> Result<SampleEvaluation, AnalysisError> {
        let Some((main, secondaries)) = connectors.split_first() else {
            return Ok(SampleEvaluation::default());
        };
        let template = &settings.analysis.vetting_prompt_template;
        let mut out = SampleEvaluation::default();

        for connector in secondaries {
            if cancel.is_cancelled() {
                return Err(AnalysisError::Cancelled);
            }
            let test = match Self::replay(connector, sample, shape, settings, cancel).await {
                Ok(test) => test,
                Err(e) if e.is_cancellation() => return Err(AnalysisError::Cancelled),
                Err(e) => {
                    tracing::warn!(
                        connector = %connector.name(),
                        shape = %shape.signature(),
                        error = %e,
                        "Secondary connector failed on replayed sample"
                    );
                    let failed = ConnectorTest::new(
                        sample.job.clone(),
                        connector.name(),
                        String::new(),
                        Duration::ZERO,
                        rust_decimal::Decimal::ZERO,
                    );
                    out.evaluations.push(ConnectorEvaluation {
                        test: failed,
                        vetting_connector: main.name().to_string(),
                        is_vetted: false,
                    });
                    continue;
                }
            };

            let is_vetted = self.vet(main, template, sample, &test.result, cancel).await?;
            tracing::debug!(
                connector = %connector.name(),
                shape = %shape.signature(),
                is_vetted,
                "Evaluated secondary connector"
            );
            out.evaluations.push(ConnectorEvaluation {
                test: test.clone(),
                vetting_connector: main.name().to_string(),
                is_vetted,
            });
            out.tests.push(test);
        }

        Ok(out)
    }
}

/// First `true`/`false` word in the reply, case-insensitive.
fn parse_verdict(text: &str) -> Option<bool> {
    text.split(|c: char| !c.is_ascii_alphabetic())
        .find_map(|word| match word.to_ascii_lowercase().as_str() {
            "true" | "yes" => Some(true),
            "false" | "no" => Some(false),
            _ => None,
        })
}
