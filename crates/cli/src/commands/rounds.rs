use roundkeeper_core::config::LoadOptions;
use roundkeeper_core::ConversationId;
use roundkeeper_db::{RoundQuery, TraceRepository};

use crate::commands::{execute, open_store, CommandResult, Failure};

/// Headers of one conversation, open rounds included.
pub fn run(options: &LoadOptions, conversation: &str, limit: Option<u32>) -> CommandResult {
    let conversation_id = ConversationId::normalize(Some(conversation));
    let label = conversation_id.as_str().to_string();

    execute(
        "rounds",
        options,
        |config| async move {
            let store = open_store(&config).await?;
            let headers = store
                .repository
                .list_rounds(&RoundQuery {
                    conversation_id: Some(conversation_id),
                    include_open: true,
                    limit,
                    ..RoundQuery::default()
                })
                .await
                .map_err(|error| Failure::storage("storage", error.to_string()))?;
            store.close().await;
            Ok(headers)
        },
        |headers| {
            let message = format!("{} round(s) in conversation `{label}`", headers.len());
            CommandResult::success_with_data("rounds", message, headers)
        },
    )
}
