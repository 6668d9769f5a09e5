use async_trait::async_trait;
use serde_json::json;

use super::param_u64;
use crate::error::{ItemError, StageError};
use crate::item::Item;
use crate::stage::{ItemOutput, Stage, StageContext, StageOutcome};

const DEFAULT_CHUNK_WORDS: usize = 24;

/// Splits page text into word-bounded chunks. Params: `chunk_words`.
pub struct Chunk;

pub(crate) fn split_words(text: &str, max_words: usize) -> Vec<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    words
        .chunks(max_words.max(1))
        .map(|chunk| chunk.join(" "))
        .collect()
}

#[async_trait]
impl Stage for Chunk {
    fn name(&self) -> &str {
        "chunk"
    }

    fn validate(&self, input: &[Item]) -> bool {
        input.iter().all(|item| item.payload.get("text").is_some())
    }

    async fn process(
        &self,
        input: Vec<Item>,
        ctx: &StageContext,
    ) -> Result<StageOutcome, StageError> {
        let max_words = param_u64(ctx.params(), "chunk_words")
            .map_or(DEFAULT_CHUNK_WORDS, |n| n as usize);

        let mut outcome = ctx
            .run_items(input, |item| async move {
                let text = item.str_field("text").unwrap_or_default();
                let chunks = split_words(text, max_words);
                if chunks.is_empty() {
                    return Err(ItemError::permanent("no extractable text"));
                }
                let source = item.payload.get("url").cloned().unwrap_or_default();
                let outputs = chunks
                    .into_iter()
                    .enumerate()
                    .map(|(k, text)| {
                        item.child(
                            format!("c{k}"),
                            json!({ "source": source, "text": text }),
                        )
                    })
                    .collect::<Vec<_>>();
                Ok(ItemOutput::from(outputs))
            })
            .await?;

        let chunks = outcome.items.len();
        outcome = outcome.with_stat("chunks", chunks);
        Ok(outcome)
    }
}
