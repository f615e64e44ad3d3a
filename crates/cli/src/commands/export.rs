use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Args;
use roundkeeper_core::config::LoadOptions;
use roundkeeper_core::{ConversationId, ExportScope, RoundId, RoundRecord, Watermark};
use roundkeeper_db::{write_jsonl_file, ExportSummary, TraceError};
use serde::Serialize;
use tracing::info;

use crate::commands::{execute, open_store, CommandResult, Failure};

#[derive(Debug, Clone, Args)]
pub struct ExportArgs {
    #[arg(long, conflicts_with = "round", help = "Export one conversation")]
    pub conversation: Option<String>,
    #[arg(long, help = "Export one round")]
    pub round: Option<String>,
    #[arg(long, help = "Resume from this round_seq (inclusive)")]
    pub since_round: Option<u64>,
    #[arg(long, help = "Within the resumed round, only events after this event_seq")]
    pub since_event: Option<u64>,
    #[arg(long, help = "Destination JSONL file")]
    pub out: PathBuf,
}

#[derive(Debug, Serialize)]
struct ExportReport {
    out: String,
    rounds: usize,
    events: usize,
    watermark: Option<Watermark>,
}

impl ExportArgs {
    fn scope(&self) -> Option<ExportScope> {
        if let Some(round) = &self.round {
            return Some(ExportScope::Round(RoundId(round.trim().to_string())));
        }
        self.conversation
            .as_deref()
            .map(|conversation| ExportScope::Conversation(ConversationId::normalize(Some(conversation))))
    }

    fn watermark(&self) -> Option<Watermark> {
        if self.since_round.is_none() && self.since_event.is_none() {
            return None;
        }
        Some(Watermark {
            round_seq: self.since_round.unwrap_or_default(),
            event_seq: self.since_event.unwrap_or_default(),
        })
    }
}

/// Writes closed rounds to `--out`. Without a scope every conversation is
/// exported in close order and watermarks do not apply.
pub fn run(options: &LoadOptions, args: &ExportArgs) -> CommandResult {
    let scope = args.scope();
    let since = args.watermark();
    if scope.is_none() && since.is_some() {
        return Failure::config("--since-round/--since-event need --conversation or --round")
            .into_result("export");
    }
    let out = args.out.clone();

    execute(
        "export",
        options,
        |config| async move {
            let store = open_store(&config).await?;
            let records = match &scope {
                Some(scope) => store.log.export(scope, since).await,
                None => store.log.export_all(None).await,
            }
            .map_err(export_failure)?;
            store.close().await;

            let summary = write_export(&records, &out)
                .map_err(|error| Failure::storage("export_write", format!("{error:#}")))?;
            info!(
                event_name = "cli.export.completed",
                correlation_id = "bootstrap",
                rounds = summary.rounds,
                events = summary.events,
                out = %out.display(),
                "trace exported"
            );
            Ok(ExportReport {
                out: out.display().to_string(),
                rounds: summary.rounds,
                events: summary.events,
                watermark: summary.watermark,
            })
        },
        |report| {
            let message = format!(
                "exported {} round(s) and {} event(s) to {}",
                report.rounds, report.events, report.out
            );
            CommandResult::success_with_data("export", message, report)
        },
    )
}

fn write_export(records: &[RoundRecord], out: &Path) -> anyhow::Result<ExportSummary> {
    if let Some(parent) = out.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating export directory `{}`", parent.display()))?;
    }
    write_jsonl_file(records, out).with_context(|| format!("writing `{}`", out.display()))
}

fn export_failure(error: TraceError) -> Failure {
    match error {
        TraceError::NotFound(round_id) => {
            Failure::not_found("round_not_found", format!("round `{round_id}` was not found"))
        }
        TraceError::StillOpen(round_id) => Failure::not_found(
            "round_open",
            format!("round `{round_id}` is still open; run `roundkeeper recover` first if it was abandoned"),
        ),
        other => Failure::storage("storage", other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use roundkeeper_core::{ExportScope, Watermark};

    use super::ExportArgs;

    fn args() -> ExportArgs {
        ExportArgs {
            conversation: None,
            round: None,
            since_round: None,
            since_event: None,
            out: PathBuf::from("trace.jsonl"),
        }
    }

    #[test]
    fn conversation_scope_is_normalized() {
        let args = ExportArgs { conversation: Some("  abc ".to_string()), ..args() };
        match args.scope() {
            Some(ExportScope::Conversation(id)) => assert_eq!(id.as_str(), "abc"),
            other => panic!("unexpected scope {other:?}"),
        }
    }

    #[test]
    fn watermark_needs_at_least_one_bound() {
        assert_eq!(args().watermark(), None);
        let args = ExportArgs { since_event: Some(4), ..args() };
        assert_eq!(args.watermark(), Some(Watermark { round_seq: 0, event_seq: 4 }));
    }
}
