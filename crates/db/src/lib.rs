pub mod connection;
pub mod export;
pub mod migrations;
pub mod repositories;
pub mod trace_log;

pub use connection::{connect, connect_with_settings, DbPool};
pub use export::{write_jsonl, write_jsonl_file, ExportError, ExportSummary};
pub use repositories::{
    resolve_library_id, InMemoryLibraryRepository, InMemoryTraceRepository, LibraryRepository,
    RepositoryError, RoundQuery, SqlLibraryRepository, SqlTraceRepository, TraceRepository,
};
pub use trace_log::{DecisionTraceLog, RoundHandle, TraceError};
