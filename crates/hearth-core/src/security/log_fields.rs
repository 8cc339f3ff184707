//! Structured log sink sanitizing.
//!
//! Every string value is passed through a [`Redactor`]; the value of any key that looks like
//! a secret is masked outright, whatever its type. Independent of the redactor instance used
//! for classifier payloads.

use super::redaction::Redactor;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

pub const MASKED_PLACEHOLDER: &str = "[MASKED]";

static SENSITIVE_KEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|passwd|secret|token|api[_\-]?key|authorization|cookie|ssn|credential)")
        .expect("sensitive key pattern must compile")
});

static LOG_REDACTOR: Lazy<Redactor> = Lazy::new(Redactor::new);

pub fn is_sensitive_key(key: &str) -> bool {
    SENSITIVE_KEY.is_match(key)
}

/// Sanitized copy of `fields`, ready to hand to `tracing`.
pub fn sanitize_log_fields(fields: &Value) -> Value {
    match fields {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                let clean = if is_sensitive_key(k) {
                    Value::String(MASKED_PLACEHOLDER.to_string())
                } else {
                    sanitize_log_fields(v)
                };
                out.insert(k.clone(), clean);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sanitize_log_fields).collect()),
        Value::String(s) => Value::String(LOG_REDACTOR.redact(s)),
        other => other.clone(),
    }
}
