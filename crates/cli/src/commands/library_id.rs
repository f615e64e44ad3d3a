use roundkeeper_core::config::LoadOptions;
use serde_json::json;

use crate::commands::{execute, open_store, CommandResult};

pub fn run(options: &LoadOptions) -> CommandResult {
    execute(
        "library-id",
        options,
        |config| async move {
            let store = open_store(&config).await?;
            let library_id = store.log.library_id().clone();
            store.close().await;
            Ok(library_id)
        },
        |library_id| {
            CommandResult::success_with_data(
                "library-id",
                library_id.as_str().to_string(),
                json!({ "library_id": library_id }),
            )
        },
    )
}
