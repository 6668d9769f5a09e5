//! Terminal output: a progress spinner driven by the progress stream, and
//! coloured audit and ledger reports.

use console::Style;
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};

use crate::ledger::{LedgerEntry, LedgerSummary};
use crate::progress::{ProgressEvent, ProgressStream, StreamMessage};
use crate::state_machine::{AuditRecord, JobStatus};

/// Spinner that follows one job's progress events.
///
/// Finishes green on completion, red on failure and yellow on cancellation.
pub struct JobProgress {
    pb: ProgressBar,
    verbose: bool,
    green: Style,
    red: Style,
    yellow: Style,
    dim: Style,
}

impl JobProgress {
    pub fn start(label: &str, verbose: bool) -> Self {
        let pb = ProgressBar::new_spinner();
        let style = ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        pb.set_style(style);
        pb.set_message(format!("queued: {label}"));
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            verbose,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
            dim: Style::new().dim(),
        }
    }

    pub fn update(&self, event: &ProgressEvent) {
        let stage = event.stage.as_deref().unwrap_or("-");
        self.pb
            .set_message(format!("{:>3}% {stage} ({})", event.progress, event.status));
        if self.verbose {
            self.pb.println(format!(
                "  {} {stage} {}% {}",
                self.dim.apply_to(event.timestamp.format("%H:%M:%S%.3f")),
                event.progress,
                event.status
            ));
        }
    }

    /// Drains the stream and returns the last event seen.
    pub async fn follow(&self, mut stream: ProgressStream) -> Option<ProgressEvent> {
        let mut last = None;
        while let Some(message) = stream.next().await {
            match message {
                StreamMessage::Event(event) => {
                    self.update(&event);
                    last = Some(event);
                }
                StreamMessage::Keepalive => self.pb.tick(),
            }
        }
        last
    }

    pub fn complete(&self, event: &ProgressEvent) {
        self.pb.finish_and_clear();
        match event.status {
            JobStatus::Completed => {
                println!("  {} Job completed", self.green.apply_to("✓"));
            }
            JobStatus::Cancelled => {
                println!("  {} Job cancelled", self.yellow.apply_to("■"));
            }
            status => {
                let reason = event.message.as_deref().unwrap_or("no reason recorded");
                println!("  {} Job {status}: {reason}", self.red.apply_to("✗"));
            }
        }
    }

    pub fn print_audit(&self, record: &AuditRecord) {
        print_audit(record);
    }
}

fn status_style(status: JobStatus) -> Style {
    match status {
        JobStatus::Completed => Style::new().green().bold(),
        JobStatus::Failed => Style::new().red().bold(),
        _ => Style::new().yellow(),
    }
}

/// Pretty JSON audit record under a coloured rule.
pub fn print_audit(record: &AuditRecord) {
    println!();
    println!("{}", status_style(record.status).apply_to("─── Audit Record ───"));
    println!(
        "{}",
        serde_json::to_string_pretty(record).unwrap_or_default()
    );
}

/// One line per stage, followed by the failed items when asked for.
pub fn print_ledger_summary(stage: &str, summary: &LedgerSummary, failures: &[LedgerEntry]) {
    let label = if summary.failed > 0 {
        Style::new().yellow().apply_to(stage)
    } else {
        Style::new().green().apply_to(stage)
    };
    println!("  {label:<12} {summary}");
    for entry in failures {
        println!(
            "      {} {} after {} attempt(s): {}",
            Style::new().red().apply_to("✗"),
            entry.item_id,
            entry.attempts,
            entry.error.as_deref().unwrap_or("unknown error")
        );
    }
}
