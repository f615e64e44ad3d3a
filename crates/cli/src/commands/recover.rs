use roundkeeper_core::config::LoadOptions;
use roundkeeper_core::RoundHeader;
use serde::Serialize;
use tracing::info;

use crate::commands::{execute, open_store, CommandResult, Failure};

#[derive(Debug, Serialize)]
struct Recovered {
    round_id: String,
    conversation_id: String,
    round_seq: u64,
    failure_code: Option<String>,
}

impl From<RoundHeader> for Recovered {
    fn from(header: RoundHeader) -> Self {
        Self {
            round_id: header.round_id.0,
            conversation_id: header.conversation_id.0,
            round_seq: header.round_seq,
            failure_code: header.failure_code,
        }
    }
}

/// Rounds still `open` are closed `partial` with `round.abandoned`. Only run
/// this while no runtime process is writing to the same store.
pub fn run(options: &LoadOptions) -> CommandResult {
    execute(
        "recover",
        options,
        |config| async move {
            let store = open_store(&config).await?;
            let recovered = store
                .log
                .recover_abandoned()
                .await
                .map_err(|error| Failure::storage("storage", error.to_string()))?;
            store.close().await;
            info!(
                event_name = "cli.recover.completed",
                correlation_id = "bootstrap",
                recovered = recovered.len(),
                "abandoned rounds closed"
            );
            Ok(recovered.into_iter().map(Recovered::from).collect::<Vec<_>>())
        },
        |recovered| {
            let message = format!("closed {} abandoned round(s)", recovered.len());
            CommandResult::success_with_data("recover", message, recovered)
        },
    )
}
