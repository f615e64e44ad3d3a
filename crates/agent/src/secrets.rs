//! Secret scrubbing applied to user input before anything is traced.
//!
//! Detected values are replaced by reference tokens of the form
//! `secret_ref:<kind>:<n>`; only the tokens reach payloads and prompts.

use std::collections::BTreeSet;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Scrubbed {
    pub text: String,
    pub refs: Vec<String>,
}

pub trait SecretScanner: Send + Sync {
    fn scrub(&self, text: &str) -> Scrubbed;
}

const PEM_BEGIN: &str = "-----BEGIN";
const PEM_END: &str = "-----END";
const PEM_DASHES: &str = "-----";

/// Pattern-based scanner for the credential shapes people read out or paste.
#[derive(Clone, Copy, Debug)]
pub struct HeuristicSecretScanner {
    pub min_token_len: usize,
    pub min_unique_ratio: f64,
}

impl Default for HeuristicSecretScanner {
    fn default() -> Self {
        Self { min_token_len: 24, min_unique_ratio: 0.55 }
    }
}

impl SecretScanner for HeuristicSecretScanner {
    fn scrub(&self, text: &str) -> Scrubbed {
        let mut refs = Vec::new();
        let without_pem = replace_pem_blocks(text, &mut refs);

        let mut output = String::with_capacity(without_pem.len());
        let mut token = String::new();
        for ch in without_pem.chars() {
            if ch.is_whitespace() {
                self.flush(&mut token, &mut output, &mut refs);
                output.push(ch);
            } else {
                token.push(ch);
            }
        }
        self.flush(&mut token, &mut output, &mut refs);

        Scrubbed { text: output, refs }
    }
}

impl HeuristicSecretScanner {
    fn flush(&self, token: &mut String, output: &mut String, refs: &mut Vec<String>) {
        if token.is_empty() {
            return;
        }
        let core = token.trim_matches(|ch: char| matches!(ch, ',' | '.' | ';' | ':' | '!' | '?' | '"' | '\'' | '(' | ')'));
        match self.classify(core) {
            Some(kind) => {
                let reference = next_ref(kind, refs);
                output.push_str(&token.replacen(core, &reference, 1));
            }
            None => output.push_str(token),
        }
        token.clear();
    }

    fn classify(&self, token: &str) -> Option<&'static str> {
        if token.starts_with(PEM_DASHES) {
            return None;
        }
        if is_aws_access_key(token) {
            return Some("aws_key");
        }
        if is_jwt(token) {
            return Some("jwt");
        }
        if self.is_high_entropy(token) {
            return Some("token");
        }
        None
    }

    fn is_high_entropy(&self, token: &str) -> bool {
        let length = token.chars().count();
        if length < self.min_token_len {
            return false;
        }
        if !token.chars().all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '+' | '/' | '=' | '_' | '-')) {
            return false;
        }
        let has_letter = token.chars().any(|ch| ch.is_ascii_alphabetic());
        let has_digit = token.chars().any(|ch| ch.is_ascii_digit());
        if !(has_letter && has_digit) {
            return false;
        }
        let unique = token.chars().collect::<BTreeSet<_>>().len();
        (unique as f64 / length as f64) > self.min_unique_ratio
    }
}

fn next_ref(kind: &str, refs: &mut Vec<String>) -> String {
    let reference = format!("secret_ref:{kind}:{}", refs.len() + 1);
    refs.push(reference.clone());
    reference
}

fn is_aws_access_key(token: &str) -> bool {
    token.len() == 20
        && (token.starts_with("AKIA") || token.starts_with("ASIA"))
        && token.chars().all(|ch| ch.is_ascii_uppercase() || ch.is_ascii_digit())
}

fn is_jwt(token: &str) -> bool {
    let segments: Vec<&str> = token.split('.').collect();
    segments.len() == 3
        && segments[0].starts_with("eyJ")
        && segments.iter().all(|segment| {
            !segment.is_empty()
                && segment.chars().all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_'))
        })
}

fn replace_pem_blocks(text: &str, refs: &mut Vec<String>) -> String {
    let mut output = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find(PEM_BEGIN) {
        output.push_str(&rest[..start]);
        let block = &rest[start..];
        let end = block
            .find(PEM_END)
            .and_then(|end_marker| {
                let after_marker = end_marker + PEM_END.len();
                block[after_marker..]
                    .find(PEM_DASHES)
                    .map(|dashes| after_marker + dashes + PEM_DASHES.len())
            })
            .unwrap_or(block.len());
        output.push_str(&next_ref("pem", refs));
        rest = &block[end..];
    }

    output.push_str(rest);
    output
}
