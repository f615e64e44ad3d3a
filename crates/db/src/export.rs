use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use roundkeeper_core::trace::{RoundEvent, RoundHeader, RoundRecord, Watermark};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("failed to write export: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode export line: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ExportLine<'a> {
    Round(&'a RoundHeader),
    Event(&'a RoundEvent),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExportSummary {
    pub rounds: usize,
    pub events: usize,
    /// Where a later export of the same scope can resume.
    pub watermark: Option<Watermark>,
}

/// Writes one `round` line per header followed by one `event` line per event.
pub fn write_jsonl<W: Write>(records: &[RoundRecord], mut out: W) -> Result<ExportSummary, ExportError> {
    let mut summary = ExportSummary::default();

    for record in records {
        serde_json::to_writer(&mut out, &ExportLine::Round(&record.header))?;
        out.write_all(b"\n")?;
        summary.rounds += 1;

        for event in &record.events {
            serde_json::to_writer(&mut out, &ExportLine::Event(event))?;
            out.write_all(b"\n")?;
            summary.events += 1;
        }

        let last_event_seq = record.events.last().map_or(0, |event| event.event_seq);
        summary.watermark = Some(Watermark {
            round_seq: record.header.round_seq,
            event_seq: last_event_seq,
        });
    }

    out.flush()?;
    Ok(summary)
}

pub fn write_jsonl_file(records: &[RoundRecord], path: &Path) -> Result<ExportSummary, ExportError> {
    let file = File::create(path)?;
    write_jsonl(records, BufWriter::new(file))
}
