use async_trait::async_trait;
use serde_json::json;

use super::param_f64;
use crate::error::{ItemError, StageError};
use crate::item::Item;
use crate::stage::{ItemOutput, Stage, StageContext, StageOutcome};

/// Price per word when `cost_per_word` is not set.
const DEFAULT_COST_PER_WORD: f64 = 0.000_02;

/// Turns each chunk into an instruction/response pair.
///
/// All calls share one partition key, so `rate_interval_ms` paces the whole
/// stage the way a provider rate limit would.
pub struct Generate;

fn first_sentence(text: &str) -> &str {
    match text.find(". ") {
        Some(end) => &text[..=end],
        None => text,
    }
}

#[async_trait]
impl Stage for Generate {
    fn name(&self) -> &str {
        "generate"
    }

    fn validate(&self, input: &[Item]) -> bool {
        input.iter().all(|item| item.str_field("text").is_some())
    }

    async fn process(
        &self,
        input: Vec<Item>,
        ctx: &StageContext,
    ) -> Result<StageOutcome, StageError> {
        let cost_per_word =
            param_f64(ctx.params(), "cost_per_word").unwrap_or(DEFAULT_COST_PER_WORD);

        ctx.run_items_keyed(
            input,
            |_| Some("llm".to_string()),
            |item| async move {
                let text = item.str_field("text").unwrap_or_default().trim();
                if text.split_whitespace().count() < 3 {
                    return Err(ItemError::permanent("chunk too short to prompt on"));
                }

                let answer = first_sentence(text).to_string();
                let words = text.split_whitespace().count() + answer.split_whitespace().count();
                let example = item.child(
                    "qa",
                    json!({
                        "instruction": format!("Summarise the following passage:\n{text}"),
                        "output": answer,
                        "source": item.payload.get("source").cloned().unwrap_or_default(),
                    }),
                );
                Ok(ItemOutput::with_cost(
                    vec![example],
                    words as f64 * cost_per_word,
                ))
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sentence_keeps_the_full_stop() {
        assert_eq!(first_sentence("One thing. Another."), "One thing.");
        assert_eq!(first_sentence("No stop here"), "No stop here");
    }
}
