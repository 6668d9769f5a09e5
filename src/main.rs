mod cli;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use serde_json::json;

use cli::{Cli, Command};
use datafactory::admission::submit_job;
use datafactory::config::FactoryConfig;
use datafactory::dispatcher::Dispatcher;
use datafactory::ledger::{ItemOutcome, JsonlLedger, Ledger, LedgerEntry, MemoryLedger};
use datafactory::orchestrator::Orchestrator;
use datafactory::progress::{ProgressBus, ProgressPublisher};
use datafactory::queue::{MemoryLeases, MemoryQueue};
use datafactory::state_machine::{AuditRecord, JobConfig, JobId};
use datafactory::store::{JobStore, MemoryJobStore};
use datafactory::ui::{JobProgress, print_ledger_summary};
use datafactory::{stages, telemetry};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    telemetry::init(&config.log_level, cli.verbose);

    match cli.command {
        Command::Demo {
            items,
            fail_every,
            out,
        } => run_demo(&config, items, fail_every, out, cli.verbose).await,
        Command::Ledger { job, stage } => show_ledger(&config, &job, stage.as_deref()).await,
        Command::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<FactoryConfig> {
    match path {
        Some(path) if !path.exists() => bail!("config file {} not found", path.display()),
        Some(path) => FactoryConfig::load_from(path)
            .with_context(|| format!("loading {}", path.display())),
        None => Ok(FactoryConfig::load()?),
    }
}

async fn open_ledger(config: &FactoryConfig) -> Result<Arc<dyn Ledger>> {
    let ledger: Arc<dyn Ledger> = match &config.ledger_path {
        Some(path) => Arc::new(
            JsonlLedger::open(path)
                .await
                .with_context(|| format!("opening ledger {}", path.display()))?,
        ),
        None => Arc::new(MemoryLedger::new()),
    };
    Ok(ledger)
}

async fn run_demo(
    config: &FactoryConfig,
    items: usize,
    fail_every: Option<u64>,
    out: Option<PathBuf>,
    verbose: bool,
) -> Result<()> {
    let ledger = open_ledger(config).await?;
    let store = Arc::new(MemoryJobStore::new());
    let queue = Arc::new(MemoryQueue::new());
    let bus = Arc::new(ProgressBus::new(64, config.worker.keepalive_interval()));

    let orchestrator = Orchestrator::new(
        stages::demo_registry()?,
        store.clone(),
        Arc::clone(&ledger),
        bus.clone(),
    );
    let dispatcher = Arc::new(Dispatcher::new(
        queue.clone(),
        Arc::new(MemoryLeases::new()),
        store.clone(),
        Arc::new(orchestrator),
        config.worker.clone(),
    ));

    let mut job_config =
        JobConfig::from_factory(config).with_params("ingest", json!({ "fail_every": fail_every }));
    if let Some(dir) = out {
        job_config = job_config.with_params("export", json!({ "output_dir": dir }));
    }
    let job = submit_job(
        store.as_ref(),
        queue.as_ref(),
        stages::demo_sources(items),
        job_config,
    )
    .await?;

    let progress = JobProgress::start(&format!("job {} ({items} sources)", job.id), verbose);
    let stream = bus.subscribe(job.id);
    let worker = {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move { dispatcher.run().await })
    };

    let last = tokio::select! {
        last = progress.follow(stream) => last,
        _ = tokio::signal::ctrl_c() => {
            store.request_cancel(job.id).await?;
            progress.follow(bus.subscribe(job.id)).await
        }
    };

    dispatcher.shutdown_token().cancel();
    worker.await?;

    if let Some(event) = &last {
        progress.complete(event);
    }
    let finished = store.load_job(job.id).await?;
    progress.print_audit(&AuditRecord::from_job(&finished));

    println!();
    for stage in ledger.stages(job.id).await? {
        let summary = ledger.summary(job.id, &stage).await?;
        print_ledger_summary(&stage, &summary, &[]);
    }
    Ok(())
}

async fn show_ledger(config: &FactoryConfig, job: &str, stage: Option<&str>) -> Result<()> {
    let path = config
        .ledger_path
        .as_ref()
        .context("no ledger_path configured (set it in datafactory.toml or DATAFACTORY_LEDGER_PATH)")?;
    let job_id: JobId = job
        .parse()
        .with_context(|| format!("invalid job id {job}"))?;
    let ledger = JsonlLedger::open(path)
        .await
        .with_context(|| format!("opening ledger {}", path.display()))?;

    let names = match stage {
        Some(stage) => vec![stage.to_string()],
        None => ledger.stages(job_id).await?,
    };
    if names.is_empty() {
        println!("No ledger entries for job {job_id}");
        return Ok(());
    }

    println!("Ledger for job {job_id}");
    for name in names {
        let summary = ledger.summary(job_id, &name).await?;
        let failures: Vec<LedgerEntry> = if stage.is_some() {
            let mut failed: Vec<LedgerEntry> = ledger
                .load(job_id, &name)
                .await?
                .into_values()
                .filter(|entry| entry.outcome == ItemOutcome::Failed)
                .collect();
            failed.sort_by(|a, b| a.item_id.cmp(&b.item_id));
            failed
        } else {
            Vec::new()
        };
        print_ledger_summary(&name, &summary, &failures);
    }

    println!("\nSource: {}", path.display());
    Ok(())
}
