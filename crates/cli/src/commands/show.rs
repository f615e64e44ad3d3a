use roundkeeper_core::config::LoadOptions;
use roundkeeper_core::{RoundId, RoundRecord};
use roundkeeper_db::TraceRepository;

use crate::commands::{execute, open_store, CommandResult, Failure};

pub fn run(options: &LoadOptions, round_id: &str) -> CommandResult {
    let round_id = RoundId(round_id.trim().to_string());

    execute(
        "show",
        options,
        |config| async move {
            let store = open_store(&config).await?;
            let header = store
                .repository
                .find_round(&round_id)
                .await
                .map_err(|error| Failure::storage("storage", error.to_string()))?
                .ok_or_else(|| {
                    Failure::not_found("round_not_found", format!("round `{round_id}` was not found"))
                })?;
            let events = store
                .repository
                .list_events(&round_id, 0)
                .await
                .map_err(|error| Failure::storage("storage", error.to_string()))?;
            store.close().await;
            Ok(RoundRecord { header, events })
        },
        |record| {
            let message = format!(
                "round {} of `{}` is {} with {} event(s)",
                record.header.round_seq,
                record.header.conversation_id,
                record.header.status.as_str(),
                record.events.len()
            );
            CommandResult::success_with_data("show", message, record)
        },
    )
}
