use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use roundkeeper_core::config::{AppConfig, LoadOptions};
use serde::Serialize;
use toml::Value;

use crate::commands::{load_config, CommandResult};

#[derive(Debug, Serialize)]
struct ConfigEntry {
    key: &'static str,
    value: String,
    source: String,
}

pub fn run(options: &LoadOptions) -> CommandResult {
    let config = match load_config(options) {
        Ok(config) => config,
        Err(failure) => return failure.into_result("config"),
    };

    let config_file_path = detect_config_path(options.config_path.as_deref());
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());
    let source = |key: &str, env_keys: &[&str]| {
        field_source(key, env_keys, config_file_doc.as_ref(), config_file_path.as_deref())
    };

    let entries: Vec<ConfigEntry> = effective_values(&config)
        .into_iter()
        .map(|(key, value, env_keys)| ConfigEntry { key, value, source: source(key, env_keys) })
        .collect();

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    lines.extend(entries.iter().map(render_line));

    CommandResult::success_with_data("config", lines.join("\n"), entries)
}

type Row = (&'static str, String, &'static [&'static str]);

fn row(key: &'static str, value: String, env_keys: &'static [&'static str]) -> Row {
    (key, value, env_keys)
}

fn effective_values(config: &AppConfig) -> Vec<Row> {
    vec![
        row("database.url", config.database.url.clone(), &["ROUNDKEEPER_DATABASE_URL"]),
        row(
            "database.max_connections",
            config.database.max_connections.to_string(),
            &["ROUNDKEEPER_DATABASE_MAX_CONNECTIONS"],
        ),
        row(
            "database.timeout_secs",
            config.database.timeout_secs.to_string(),
            &["ROUNDKEEPER_DATABASE_TIMEOUT_SECS"],
        ),
        row(
            "library.id",
            config.library.id.clone().unwrap_or_else(|| "<stored>".to_string()),
            &["ROUNDKEEPER_LIBRARY_ID"],
        ),
        row("llm.timeout_secs", config.llm.timeout_secs.to_string(), &["ROUNDKEEPER_LLM_TIMEOUT_SECS"]),
        row("llm.max_attempts", config.llm.max_attempts.to_string(), &["ROUNDKEEPER_LLM_MAX_ATTEMPTS"]),
        row(
            "tools.timeout_secs",
            config.tools.timeout_secs.to_string(),
            &["ROUNDKEEPER_TOOLS_TIMEOUT_SECS"],
        ),
        row(
            "tools.max_attempts",
            config.tools.max_attempts.to_string(),
            &["ROUNDKEEPER_TOOLS_MAX_ATTEMPTS"],
        ),
        row(
            "rounds.budget_secs",
            config.rounds.budget_secs.to_string(),
            &["ROUNDKEEPER_ROUNDS_BUDGET_SECS"],
        ),
        row(
            "rounds.confirmation_timeout_secs",
            config.rounds.confirmation_timeout_secs.to_string(),
            &["ROUNDKEEPER_ROUNDS_CONFIRMATION_TIMEOUT_SECS"],
        ),
        row("rounds.prompt_excerpt_chars", config.rounds.prompt_excerpt_chars.to_string(), &[]),
        row(
            "logging.level",
            config.logging.level.clone(),
            &["ROUNDKEEPER_LOGGING_LEVEL", "ROUNDKEEPER_LOG_LEVEL"],
        ),
        row(
            "logging.format",
            format!("{:?}", config.logging.format).to_ascii_lowercase(),
            &["ROUNDKEEPER_LOGGING_FORMAT", "ROUNDKEEPER_LOG_FORMAT"],
        ),
    ]
}

fn detect_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return path.exists().then(|| path.to_path_buf());
    }

    let root = PathBuf::from("roundkeeper.toml");
    if root.exists() {
        return Some(root);
    }

    let nested = PathBuf::from("config/roundkeeper.toml");
    if nested.exists() {
        return Some(nested);
    }

    None
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_keys: &[&str],
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_keys.iter().find(|key| env::var_os(key).is_some()) {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(entry: &ConfigEntry) -> String {
    format!("- {} = {} (source: {})", entry.key, entry.value, entry.source)
}

#[cfg(test)]
mod tests {
    use super::contains_path;

    #[test]
    fn dotted_paths_resolve_in_toml() {
        let doc: toml::Value = "[rounds]\nbudget_secs = 60\n".parse().expect("toml");
        assert!(contains_path(&doc, "rounds.budget_secs"));
        assert!(!contains_path(&doc, "rounds.confirmation_timeout_secs"));
    }
}
