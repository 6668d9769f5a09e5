use async_trait::async_trait;

use super::param_f64;
use crate::error::StageError;
use crate::item::Item;
use crate::stage::{ItemOutput, Stage, StageContext, StageOutcome};

const DEFAULT_MIN_SCORE: f64 = 0.5;

/// Scores generated examples and drops the ones under `min_score`.
///
/// Dropped examples are successes with no output, not failures: they never
/// count towards the abort threshold.
pub struct Score;

/// Mean of a length-balance check and a format check, in `[0, 1]`.
pub(crate) fn quality_score(instruction: &str, output: &str) -> f64 {
    let out_words = output.split_whitespace().count() as f64;
    let in_words = instruction.split_whitespace().count().max(1) as f64;
    let ratio = out_words / in_words;
    let balance = if ratio >= 0.1 { 1.0 } else { ratio / 0.1 };

    let well_formed = !output.trim().is_empty()
        && output.trim_end().ends_with(['.', '!', '?'])
        && output.chars().next().is_some_and(char::is_uppercase);
    let format = if well_formed { 1.0 } else { 0.0 };

    (balance + format) / 2.0
}

#[async_trait]
impl Stage for Score {
    fn name(&self) -> &str {
        "score"
    }

    fn validate(&self, input: &[Item]) -> bool {
        input
            .iter()
            .all(|item| item.str_field("instruction").is_some() && item.str_field("output").is_some())
    }

    async fn process(
        &self,
        input: Vec<Item>,
        ctx: &StageContext,
    ) -> Result<StageOutcome, StageError> {
        let min_score = param_f64(ctx.params(), "min_score").unwrap_or(DEFAULT_MIN_SCORE);

        let outcome = ctx
            .run_items(input, |mut item| async move {
                let score = quality_score(
                    item.str_field("instruction").unwrap_or_default(),
                    item.str_field("output").unwrap_or_default(),
                );
                if score < min_score {
                    return Ok(ItemOutput::default());
                }
                if let Some(fields) = item.payload.as_object_mut() {
                    fields.insert("quality_score".into(), score.into());
                }
                Ok(ItemOutput::from(item))
            })
            .await?;

        let dropped = outcome.stats.succeeded.saturating_sub(outcome.items.len());
        Ok(outcome.with_stat("dropped", dropped))
    }
}
