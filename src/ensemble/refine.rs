//! Refinement and the degradation ladder.
//!
//! ```text
//! valid answers == 0            → NoValidResponses (hard failure)
//! valid answers == 1            → returned unchanged (unless refine_single_response)
//! refinement call succeeds      → synthesized answer
//! refinement fails, 1 answer    → that answer unchanged
//! refinement fails, 2+ answers  → labeled concatenation
//! ```

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::client::{ChatClient, ChatPrompt};
use crate::ensemble::error::EnsembleError;
use crate::ensemble::types::{BackendAnswer, Refined, Strategy};
use crate::resilience::{FailureKind, RequestDriver};

/// Instruction given to the refinement backend.
pub const SYNTHESIS_INSTRUCTIONS: &str = "You are an expert at synthesizing multiple AI responses into a single, \
high-quality answer. Combine the strengths of each response, correct any inaccuracies, \
and avoid favoring a particular model. Be concise and do not mention the individual \
models or that several responses were combined.";

/// Build the synthesis prompt from the original prompt and the valid answers,
/// numbered in order and labeled with their backend.
pub fn build_synthesis_prompt(prompt: &str, answers: &[(&str, &str)]) -> ChatPrompt {
    let mut user = format!("Original prompt:\n{prompt}\n\n");
    for (index, (backend, text)) in answers.iter().enumerate() {
        user.push_str(&format!("Model {} Response ({backend}):\n{text}\n\n", index + 1));
    }
    user.push_str("Synthesize these responses into a single, refined answer to the original prompt.");
    ChatPrompt::user(user).with_system(SYNTHESIS_INSTRUCTIONS)
}

/// Fallback answer when refinement fails: every valid answer under its backend label.
pub fn concatenate(answers: &[(&str, &str)]) -> String {
    answers
        .iter()
        .map(|(backend, text)| format!("Response from {backend}:\n{text}"))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Turns fan-out answers into one final answer.
#[derive(Debug, Clone)]
pub struct Refiner {
    driver: RequestDriver,
    refine_single_response: bool,
}

impl Refiner {
    pub fn new(driver: RequestDriver, refine_single_response: bool) -> Self {
        Self {
            driver,
            refine_single_response,
        }
    }

    pub async fn refine(
        &self,
        client: &dyn ChatClient,
        prompt: &str,
        answers: &[BackendAnswer],
        refinement_backend: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Refined, EnsembleError> {
        let valid: Vec<(&str, &str)> = answers
            .iter()
            .filter_map(|answer| answer.text().map(|text| (answer.backend.as_str(), text)))
            .collect();

        let single = match valid.as_slice() {
            [] => {
                tracing::error!("No valid responses available for refinement");
                return Err(EnsembleError::NoValidResponses);
            }
            [(_, text)] => Some(*text),
            _ => None,
        };

        if let Some(text) = single {
            if !self.refine_single_response {
                tracing::info!("Single valid response, skipping refinement");
                return Ok(Refined {
                    text: text.to_string(),
                    strategy: Strategy::SingleResponse,
                    fallback: false,
                });
            }
        }

        let synthesis = build_synthesis_prompt(prompt, &valid);
        tracing::info!(
            refinement_backend,
            answers = valid.len(),
            prompt_len = synthesis.len(),
            "Refining responses"
        );

        let failure = match self
            .driver
            .send(client, &synthesis, refinement_backend, timeout, cancel)
            .await
        {
            Ok(text) => {
                return Ok(Refined {
                    text,
                    strategy: Strategy::Synthesized,
                    fallback: false,
                })
            }
            Err(failure) => failure,
        };

        if failure.kind == FailureKind::Cancelled {
            return Err(EnsembleError::Cancelled);
        }

        tracing::warn!(
            refinement_backend,
            kind = %failure.kind,
            error = %failure.message,
            "Refinement failed, falling back to unrefined answers"
        );
        Ok(match single {
            Some(text) => Refined {
                text: text.to_string(),
                strategy: Strategy::SingleResponse,
                fallback: true,
            },
            None => Refined {
                text: concatenate(&valid),
                strategy: Strategy::Concatenated,
                fallback: true,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthesis_prompt_numbers_and_labels_answers() {
        let prompt = build_synthesis_prompt("Why is the sky blue?", &[("a", "X"), ("c", "Y")]);
        assert_eq!(prompt.system.as_deref(), Some(SYNTHESIS_INSTRUCTIONS));
        assert!(prompt.user.starts_with("Original prompt:\nWhy is the sky blue?"));
        assert!(prompt.user.contains("Model 1 Response (a):\nX"));
        assert!(prompt.user.contains("Model 2 Response (c):\nY"));
        assert!(!prompt.user.contains("Model 3"));
    }

    #[test]
    fn test_concatenate_labels_each_answer() {
        assert_eq!(
            concatenate(&[("a", "X"), ("c", "Y")]),
            "Response from a:\nX\n\nResponse from c:\nY"
        );
    }
}
