use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub library: LibraryConfig,
    pub llm: LlmConfig,
    pub tools: ToolsConfig,
    pub rounds: RoundsConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug, Default)]
pub struct LibraryConfig {
    /// Pins the library identifier instead of the one persisted at first start.
    pub id: Option<String>,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub timeout_secs: u64,
    /// Total generation attempts per round, first try included.
    pub max_attempts: u32,
}

#[derive(Clone, Debug)]
pub struct ToolsConfig {
    pub timeout_secs: u64,
    pub max_attempts: u32,
}

#[derive(Clone, Debug)]
pub struct RoundsConfig {
    pub budget_secs: u64,
    pub confirmation_timeout_secs: u64,
    pub prompt_excerpt_chars: usize,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub library_id: Option<String>,
    pub round_budget_secs: Option<u64>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://roundkeeper.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            library: LibraryConfig::default(),
            llm: LlmConfig {
                timeout_secs: 30,
                max_attempts: 2,
            },
            tools: ToolsConfig { timeout_secs: 20, max_attempts: 2 },
            rounds: RoundsConfig {
                budget_secs: 120,
                confirmation_timeout_secs: 30,
                prompt_excerpt_chars: 8000,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl LlmConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl ToolsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl RoundsConfig {
    pub fn budget(&self) -> Duration {
        Duration::from_secs(self.budget_secs)
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_secs)
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected =
                options.config_path.unwrap_or_else(|| PathBuf::from("roundkeeper.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(library) = patch.library {
            if let Some(id) = library.id {
                self.library.id = Some(id);
            }
        }

        if let Some(llm) = patch.llm {
            if let Some(timeout_secs) = llm.timeout_secs {
                self.llm.timeout_secs = timeout_secs;
            }
            if let Some(max_attempts) = llm.max_attempts {
                self.llm.max_attempts = max_attempts;
            }
        }

        if let Some(tools) = patch.tools {
            if let Some(timeout_secs) = tools.timeout_secs {
                self.tools.timeout_secs = timeout_secs;
            }
            if let Some(max_attempts) = tools.max_attempts {
                self.tools.max_attempts = max_attempts;
            }
        }

        if let Some(rounds) = patch.rounds {
            if let Some(budget_secs) = rounds.budget_secs {
                self.rounds.budget_secs = budget_secs;
            }
            if let Some(confirmation_timeout_secs) = rounds.confirmation_timeout_secs {
                self.rounds.confirmation_timeout_secs = confirmation_timeout_secs;
            }
            if let Some(prompt_excerpt_chars) = rounds.prompt_excerpt_chars {
                self.rounds.prompt_excerpt_chars = prompt_excerpt_chars;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("ROUNDKEEPER_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("ROUNDKEEPER_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_u32("ROUNDKEEPER_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("ROUNDKEEPER_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("ROUNDKEEPER_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("ROUNDKEEPER_LIBRARY_ID") {
            self.library.id = Some(value);
        }

        if let Some(value) = read_env("ROUNDKEEPER_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_u64("ROUNDKEEPER_LLM_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("ROUNDKEEPER_LLM_MAX_ATTEMPTS") {
            self.llm.max_attempts = parse_u32("ROUNDKEEPER_LLM_MAX_ATTEMPTS", &value)?;
        }

        if let Some(value) = read_env("ROUNDKEEPER_TOOLS_TIMEOUT_SECS") {
            self.tools.timeout_secs = parse_u64("ROUNDKEEPER_TOOLS_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("ROUNDKEEPER_TOOLS_MAX_ATTEMPTS") {
            self.tools.max_attempts = parse_u32("ROUNDKEEPER_TOOLS_MAX_ATTEMPTS", &value)?;
        }

        if let Some(value) = read_env("ROUNDKEEPER_ROUNDS_BUDGET_SECS") {
            self.rounds.budget_secs = parse_u64("ROUNDKEEPER_ROUNDS_BUDGET_SECS", &value)?;
        }
        if let Some(value) = read_env("ROUNDKEEPER_ROUNDS_CONFIRMATION_TIMEOUT_SECS") {
            self.rounds.confirmation_timeout_secs =
                parse_u64("ROUNDKEEPER_ROUNDS_CONFIRMATION_TIMEOUT_SECS", &value)?;
        }

        let log_level =
            read_env("ROUNDKEEPER_LOGGING_LEVEL").or_else(|| read_env("ROUNDKEEPER_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("ROUNDKEEPER_LOGGING_FORMAT").or_else(|| read_env("ROUNDKEEPER_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(library_id) = overrides.library_id {
            self.library.id = Some(library_id);
        }
        if let Some(round_budget_secs) = overrides.round_budget_secs {
            self.rounds.budget_secs = round_budget_secs;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_library(&self.library)?;
        validate_llm(&self.llm)?;
        validate_tools(&self.tools)?;
        validate_rounds(&self.rounds)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("roundkeeper.toml"), PathBuf::from("config/roundkeeper.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_library(library: &LibraryConfig) -> Result<(), ConfigError> {
    if let Some(id) = &library.id {
        if id.trim().is_empty() || id.chars().any(char::is_whitespace) {
            return Err(ConfigError::Validation(
                "library.id must be a non-empty token without whitespace".to_string(),
            ));
        }
    }
    Ok(())
}

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    if llm.timeout_secs == 0 || llm.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "llm.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    if llm.max_attempts == 0 || llm.max_attempts > 5 {
        return Err(ConfigError::Validation(
            "llm.max_attempts must be in range 1..=5".to_string(),
        ));
    }

    Ok(())
}

fn validate_tools(tools: &ToolsConfig) -> Result<(), ConfigError> {
    if tools.timeout_secs == 0 || tools.timeout_secs > 600 {
        return Err(ConfigError::Validation(
            "tools.timeout_secs must be in range 1..=600".to_string(),
        ));
    }
    if tools.max_attempts == 0 || tools.max_attempts > 5 {
        return Err(ConfigError::Validation(
            "tools.max_attempts must be in range 1..=5".to_string(),
        ));
    }
    Ok(())
}

fn validate_rounds(rounds: &RoundsConfig) -> Result<(), ConfigError> {
    if rounds.budget_secs == 0 {
        return Err(ConfigError::Validation(
            "rounds.budget_secs must be greater than zero".to_string(),
        ));
    }
    if rounds.confirmation_timeout_secs == 0
        || rounds.confirmation_timeout_secs > rounds.budget_secs
    {
        return Err(ConfigError::Validation(
            "rounds.confirmation_timeout_secs must be in range 1..=rounds.budget_secs".to_string(),
        ));
    }
    if rounds.prompt_excerpt_chars < 64 {
        return Err(ConfigError::Validation(
            "rounds.prompt_excerpt_chars must be at least 64".to_string(),
        ));
    }
    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    library: Option<LibraryPatch>,
    llm: Option<LlmPatch>,
    tools: Option<ToolsPatch>,
    rounds: Option<RoundsPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LibraryPatch {
    id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    timeout_secs: Option<u64>,
    max_attempts: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct ToolsPatch {
    timeout_secs: Option<u64>,
    max_attempts: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct RoundsPatch {
    budget_secs: Option<u64>,
    confirmation_timeout_secs: Option<u64>,
    prompt_excerpt_chars: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
