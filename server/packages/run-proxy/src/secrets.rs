use std::collections::BTreeMap;
use std::sync::Arc;

use acp_stdio_bridge::Redactor;

pub const REDACTED: &str = "[REDACTED]";

/// Shorter values are too likely to match ordinary output.
const MIN_SECRET_LEN: usize = 6;

const SECRET_KEY_MARKERS: [&str; 4] = ["TOKEN", "SECRET", "PASSWORD", "KEY"];

pub fn is_secret_key(key: &str) -> bool {
    let upper = key.to_ascii_uppercase();
    SECRET_KEY_MARKERS.iter().any(|marker| upper.contains(marker))
}

/// Values that must never reach logs or orchestrator updates verbatim.
#[derive(Debug, Clone, Default)]
pub struct SecretSet {
    values: Vec<String>,
}

impl SecretSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, value: &str) {
        let value = value.trim();
        if value.len() < MIN_SECRET_LEN || self.values.iter().any(|known| known == value) {
            return;
        }
        self.values.push(value.to_string());
        // Longest first, so a secret containing another is replaced whole.
        self.values.sort_by_key(|known| std::cmp::Reverse(known.len()));
    }

    pub fn add_env(&mut self, env: &BTreeMap<String, String>) {
        for (key, value) in env {
            if is_secret_key(key) {
                self.add(value);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn redact(&self, text: &str) -> String {
        let mut out = text.to_string();
        for secret in &self.values {
            if out.contains(secret.as_str()) {
                out = out.replace(secret.as_str(), REDACTED);
            }
        }
        out
    }

    pub fn redactor(&self) -> Redactor {
        let secrets = self.clone();
        Arc::new(move |line: &str| secrets.redact(line))
    }
}
