//! The built-in demo pipeline: ingest, chunk, generate, score, export.
//!
//! Each stage does a small amount of real work on synthetic sources so the
//! whole orchestration path can be run and observed from the CLI.

mod chunk;
mod export;
mod generate;
mod ingest;
mod score;

pub use chunk::Chunk;
pub use export::Export;
pub use generate::Generate;
pub use ingest::Ingest;
pub use score::Score;

use serde_json::{Value, json};

use crate::error::Result;
use crate::item::Item;
use crate::stage::StageRegistry;

/// The five demo stages in pipeline order.
pub fn demo_registry() -> Result<StageRegistry> {
    StageRegistry::builder()
        .stage(Ingest)
        .stage(Chunk)
        .stage(Generate)
        .stage(Score)
        .stage(Export)
        .build()
}

/// `count` synthetic source items spread over three domains.
pub fn demo_sources(count: usize) -> Vec<Item> {
    (0..count)
        .map(|n| {
            Item::new(
                format!("src-{n:03}"),
                json!({
                    "n": n,
                    "url": format!("https://site{}.example/articles/{n}", n % 3),
                }),
            )
        })
        .collect()
}

fn param_u64(params: &Value, key: &str) -> Option<u64> {
    params.get(key).and_then(Value::as_u64)
}

fn param_f64(params: &Value, key: &str) -> Option<f64> {
    params.get(key).and_then(Value::as_f64)
}
