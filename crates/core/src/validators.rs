use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidatorStatus {
    Ok,
    Warn,
    Error,
    Escalate,
    Retry,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorResult {
    pub validator_id: String,
    pub code: String,
    pub status: ValidatorStatus,
    pub message: String,
}

impl ValidatorResult {
    fn new(validator_id: &str, code: &str, status: ValidatorStatus, message: &str) -> Self {
        Self {
            validator_id: validator_id.to_string(),
            code: code.to_string(),
            status,
            message: message.to_string(),
        }
    }
}

pub trait Validator: Send + Sync {
    fn id(&self) -> &'static str;
    fn validate(&self, text: &str) -> ValidatorResult;
}

pub fn run_validators(validators: &[Box<dyn Validator>], text: &str) -> Vec<ValidatorResult> {
    validators.iter().map(|validator| validator.validate(text)).collect()
}

pub fn should_retry(results: &[ValidatorResult]) -> bool {
    results.iter().any(|result| result.status == ValidatorStatus::Retry)
}

pub fn is_blocked(results: &[ValidatorResult]) -> bool {
    results
        .iter()
        .any(|result| matches!(result.status, ValidatorStatus::Error | ValidatorStatus::Escalate))
}

const FILLER_WORDS: &[&str] = &["uh", "um", "er", "erm", "hmm", "mm", "ah", "eh"];

/// Flags input that carries no actionable content (empty, symbol noise, filler).
#[derive(Clone, Copy, Debug, Default)]
pub struct CoherenceValidator;

impl Validator for CoherenceValidator {
    fn id(&self) -> &'static str {
        "basic.coherency"
    }

    fn validate(&self, text: &str) -> ValidatorResult {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return ValidatorResult::new(
                self.id(),
                "validator.empty",
                ValidatorStatus::Escalate,
                "input is empty",
            );
        }

        if !trimmed.chars().any(char::is_alphanumeric) {
            return ValidatorResult::new(
                self.id(),
                "validator.no_content",
                ValidatorStatus::Escalate,
                "input has no words",
            );
        }

        let words: Vec<String> = trimmed
            .split_whitespace()
            .map(|word| {
                word.trim_matches(|ch: char| !ch.is_alphanumeric()).to_ascii_lowercase()
            })
            .filter(|word| !word.is_empty())
            .collect();
        if !words.is_empty() && words.iter().all(|word| FILLER_WORDS.contains(&word.as_str())) {
            return ValidatorResult::new(
                self.id(),
                "validator.filler_only",
                ValidatorStatus::Escalate,
                "input is filler only",
            );
        }

        ValidatorResult::new(self.id(), "validator.ok", ValidatorStatus::Ok, "coherent")
    }
}

/// Checks generated output before it is spoken back.
#[derive(Clone, Copy, Debug)]
pub struct OutputValidator {
    pub max_chars: usize,
}

impl Default for OutputValidator {
    fn default() -> Self {
        Self { max_chars: 4000 }
    }
}

impl Validator for OutputValidator {
    fn id(&self) -> &'static str {
        "output.shape"
    }

    fn validate(&self, text: &str) -> ValidatorResult {
        if text.trim().is_empty() {
            return ValidatorResult::new(
                self.id(),
                "validator.output_empty",
                ValidatorStatus::Retry,
                "generated output is empty",
            );
        }
        if text.chars().count() > self.max_chars {
            return ValidatorResult::new(
                self.id(),
                "validator.output_too_long",
                ValidatorStatus::Warn,
                "generated output exceeds the spoken length limit",
            );
        }
        ValidatorResult::new(self.id(), "validator.ok", ValidatorStatus::Ok, "output accepted")
    }
}
