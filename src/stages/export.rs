use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;

use crate::error::{PipelineError, StageError};
use crate::item::Item;
use crate::stage::{Stage, StageContext, StageOutcome, StageStats};

/// Writes the surviving examples as one JSON-lines dataset plus a short card.
///
/// Works on the whole batch at once. Its only output is a manifest item
/// naming the written file. Params: `output_dir` (nothing is written when unset).
pub struct Export;

fn record(item: &Item) -> Value {
    json!({
        "id": item.id,
        "instruction": item.payload.get("instruction").cloned().unwrap_or_default(),
        "output": item.payload.get("output").cloned().unwrap_or_default(),
        "source": item.payload.get("source").cloned().unwrap_or_default(),
        "quality_score": item.payload.get("quality_score").cloned().unwrap_or_default(),
    })
}

fn dataset_card(job: &str, records: &[Value]) -> String {
    let mean_score = if records.is_empty() {
        0.0
    } else {
        records
            .iter()
            .filter_map(|r| r["quality_score"].as_f64())
            .sum::<f64>()
            / records.len() as f64
    };
    format!(
        "# Dataset {job}\n\n- examples: {}\n- mean quality score: {mean_score:.2}\n- format: jsonl\n",
        records.len()
    )
}

async fn write_dataset(dir: &Path, job: &str, records: &[Value]) -> Result<PathBuf, PipelineError> {
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(format!("{job}.jsonl"));
    let mut file = tokio::fs::File::create(&path).await?;
    for record in records {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        file.write_all(&line).await?;
    }
    file.flush().await?;
    tokio::fs::write(dir.join(format!("{job}_card.md")), dataset_card(job, records)).await?;
    Ok(path)
}

#[async_trait]
impl Stage for Export {
    fn name(&self) -> &str {
        "export"
    }

    fn validate(&self, input: &[Item]) -> bool {
        !input.is_empty()
    }

    async fn process(
        &self,
        input: Vec<Item>,
        ctx: &StageContext,
    ) -> Result<StageOutcome, StageError> {
        if ctx.check_cancelled().await? {
            return Ok(StageOutcome::default());
        }

        let job = ctx.job_id().to_string();
        let records: Vec<Value> = input.iter().map(record).collect();
        let output_dir = ctx
            .params()
            .get("output_dir")
            .and_then(Value::as_str)
            .map(PathBuf::from);

        let path = match &output_dir {
            Some(dir) => Some(
                write_dataset(dir, &job, &records)
                    .await
                    .map_err(|err| StageError::fatal("export", format!("writing dataset: {err}")))?,
            ),
            None => None,
        };
        if let Some(path) = &path {
            tracing::info!(job = %job, path = %path.display(), records = records.len(), "dataset exported");
        }

        let manifest = Item::new(
            format!("export-{job}"),
            json!({
                "format": "jsonl",
                "records": records.len(),
                "path": path.as_ref().map(|p| p.display().to_string()),
            }),
        );
        Ok(StageOutcome {
            items: vec![manifest],
            failures: Vec::new(),
            stats: StageStats {
                input: input.len(),
                succeeded: input.len(),
                ..Default::default()
            },
        })
    }
}
