pub mod config;
pub mod export;
pub mod library_id;
pub mod migrate;
pub mod recover;
pub mod rounds;
pub mod show;

use std::future::Future;
use std::sync::Arc;

use roundkeeper_core::config::{AppConfig, LoadOptions};
use roundkeeper_db::{
    connect, migrations, resolve_library_id, DbPool, DecisionTraceLog, SqlLibraryRepository,
    SqlTraceRepository,
};
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: u8,
    pub output: String,
}

#[derive(Debug, Serialize)]
struct CommandOutcome {
    command: String,
    status: String,
    error_class: Option<String>,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

impl CommandResult {
    pub fn success(command: &str, message: impl Into<String>) -> Self {
        Self::success_with(command, message, None)
    }

    pub fn success_with_data(command: &str, message: impl Into<String>, data: impl Serialize) -> Self {
        Self::success_with(command, message, serde_json::to_value(data).ok())
    }

    fn success_with(command: &str, message: impl Into<String>, data: Option<Value>) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "ok".to_string(),
            error_class: None,
            message: message.into(),
            data,
        };
        Self { exit_code: 0, output: serialize_payload(payload) }
    }

    pub fn failure(
        command: &str,
        error_class: &str,
        message: impl Into<String>,
        exit_code: u8,
    ) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "error".to_string(),
            error_class: Some(error_class.to_string()),
            message: message.into(),
            data: None,
        };
        Self { exit_code, output: serialize_payload(payload) }
    }
}

fn serialize_payload(payload: CommandOutcome) -> String {
    serde_json::to_string(&payload).unwrap_or_else(|error| {
        format!(
            "{{\"command\":\"unknown\",\"status\":\"error\",\"error_class\":\"serialization\",\"message\":\"{}\"}}",
            error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
        )
    })
}

/// Why a command stopped, with the exit code operators script against.
#[derive(Debug)]
pub(crate) struct Failure {
    error_class: &'static str,
    message: String,
    exit_code: u8,
}

impl Failure {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self { error_class: "config_validation", message: message.into(), exit_code: 2 }
    }

    pub(crate) fn runtime(message: impl Into<String>) -> Self {
        Self { error_class: "runtime_init", message: message.into(), exit_code: 3 }
    }

    pub(crate) fn connectivity(message: impl Into<String>) -> Self {
        Self { error_class: "db_connectivity", message: message.into(), exit_code: 4 }
    }

    pub(crate) fn storage(error_class: &'static str, message: impl Into<String>) -> Self {
        Self { error_class, message: message.into(), exit_code: 5 }
    }

    pub(crate) fn not_found(error_class: &'static str, message: impl Into<String>) -> Self {
        Self { error_class, message: message.into(), exit_code: 6 }
    }

    pub(crate) fn into_result(self, command: &str) -> CommandResult {
        CommandResult::failure(command, self.error_class, self.message, self.exit_code)
    }
}

/// Migrated pool plus the trace log bound to this deployment's library id.
pub(crate) struct Store {
    pub pool: DbPool,
    pub repository: SqlTraceRepository,
    pub log: DecisionTraceLog,
}

impl Store {
    pub(crate) async fn close(self) {
        self.pool.close().await;
    }
}

pub(crate) fn load_config(options: &LoadOptions) -> Result<AppConfig, Failure> {
    AppConfig::load(options.clone())
        .map_err(|error| Failure::config(format!("configuration issue: {error}")))
}

/// Runs one command body on a fresh single-threaded runtime.
pub(crate) fn block_on<T, F>(future: F) -> Result<T, Failure>
where
    F: Future<Output = Result<T, Failure>>,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|error| Failure::runtime(format!("failed to initialize async runtime: {error}")))?;
    runtime.block_on(future)
}

pub(crate) async fn connect_pool(config: &AppConfig) -> Result<DbPool, Failure> {
    connect(&config.database).await.map_err(|error| Failure::connectivity(error.to_string()))
}

/// Connects, applies pending migrations, and resolves the library id.
pub(crate) async fn open_store(config: &AppConfig) -> Result<Store, Failure> {
    let pool = connect_pool(config).await?;
    migrations::run_pending(&pool)
        .await
        .map_err(|error| Failure::storage("migration", error.to_string()))?;

    let library_id =
        resolve_library_id(&SqlLibraryRepository::new(pool.clone()), config.library.id.as_deref())
            .await
            .map_err(|error| Failure::storage("storage", error.to_string()))?;

    let repository = SqlTraceRepository::new(pool.clone());
    let log = DecisionTraceLog::new(Arc::new(repository.clone()), library_id);
    Ok(Store { pool, repository, log })
}

/// Shared shape of every command: load config, then run `body` against it.
pub(crate) fn execute<T, F, Fut>(
    command: &str,
    options: &LoadOptions,
    body: F,
    render: impl FnOnce(T) -> CommandResult,
) -> CommandResult
where
    F: FnOnce(AppConfig) -> Fut,
    Fut: Future<Output = Result<T, Failure>>,
{
    let outcome = load_config(options).and_then(|config| block_on(body(config)));
    match outcome {
        Ok(value) => render(value),
        Err(failure) => failure.into_result(command),
    }
}
