use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::json;

use super::param_u64;
use crate::error::{ItemError, StageError};
use crate::item::Item;
use crate::stage::{ItemOutput, Stage, StageContext, StageOutcome};

const TOPICS: [&str; 4] = ["storage engines", "query planning", "replication", "compaction"];

/// Fetches each source URL. Partitioned by domain so the rate gate applies
/// per site.
///
/// Params: `fail_every` makes every k-th source fail permanently.
pub struct Ingest;

pub(crate) fn domain(url: &str) -> Option<&str> {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let host = rest.split(['/', '?', '#']).next()?;
    (!host.is_empty()).then_some(host)
}

fn synthetic_page(n: u64) -> String {
    let topic = TOPICS[(n % TOPICS.len() as u64) as usize];
    (0..(3 + n % 5))
        .map(|k| format!("Article {n} part {k} explains how {topic} behave under load."))
        .collect::<Vec<_>>()
        .join(" ")
}

#[async_trait]
impl Stage for Ingest {
    fn name(&self) -> &str {
        "ingest"
    }

    fn validate(&self, input: &[Item]) -> bool {
        input.iter().all(|item| item.str_field("url").is_some())
    }

    async fn process(
        &self,
        input: Vec<Item>,
        ctx: &StageContext,
    ) -> Result<StageOutcome, StageError> {
        let fail_every = param_u64(ctx.params(), "fail_every").filter(|k| *k > 0);
        // Sources whose first fetch already hit a connection reset.
        let flaky_seen: Mutex<HashSet<String>> = Mutex::new(HashSet::new());

        ctx.run_items_keyed(
            input,
            |item| item.str_field("url").and_then(domain).map(str::to_string),
            |item| {
                let n = item.payload["n"].as_u64().unwrap_or_default();
                let first_try = n % 4 == 1
                    && flaky_seen
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(item.id.clone());
                async move {
                    if first_try {
                        return Err(ItemError::transient("connection reset by peer"));
                    }
                    if fail_every.is_some_and(|k| n % k == k - 1) {
                        return Err(ItemError::permanent("source returned 404"));
                    }
                    let url = item.str_field("url").unwrap_or_default().to_string();
                    let host = domain(&url).map(str::to_string);
                    let page = item.child(
                        "page",
                        json!({
                            "n": n,
                            "url": url,
                            "domain": host,
                            "text": synthetic_page(n),
                        }),
                    );
                    Ok(ItemOutput::from(page))
                }
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_extraction() {
        assert_eq!(domain("https://site1.example/a/b"), Some("site1.example"));
        assert_eq!(domain("http://host:8080?q=1"), Some("host:8080"));
        assert_eq!(domain("bare.example/path"), Some("bare.example"));
        assert_eq!(domain("https:///nothing"), None);
    }

    #[test]
    fn synthetic_pages_vary_in_length() {
        let short = synthetic_page(0);
        let long = synthetic_page(4);
        assert!(long.len() > short.len());
        assert!(short.contains("storage engines"));
    }
}
