//! Trust-boundary utilities: PII redaction for outbound classifier payloads and
//! sanitizing of structured log fields.

pub mod log_fields;
pub mod redaction;

pub use log_fields::{is_sensitive_key, sanitize_log_fields, MASKED_PLACEHOLDER};
pub use redaction::{Redactor, PROTECTED_PLACEHOLDER};
