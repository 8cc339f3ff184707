//! Best-effort extraction of a JSON object from free-text model output.
//!
//! Takes the span from the first `{` to the last `}` and parses it. Prose or code fences
//! around the object are tolerated; two separate objects in one reply are not, since the
//! span then covers both and fails to parse.

use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("no JSON object in response")]
    NoObject,

    /// An opening brace without a closing one after it (usually truncated output).
    #[error("unbalanced braces in response")]
    Unbalanced,

    #[error("invalid JSON object: {0}")]
    Invalid(#[from] serde_json::Error),
}

pub fn extract_json_object(text: &str) -> Result<Value, ExtractError> {
    let start = text.find('{').ok_or(ExtractError::NoObject)?;
    let end = match text.rfind('}') {
        Some(end) if end > start => end,
        _ => return Err(ExtractError::Unbalanced),
    };
    Ok(serde_json::from_str(&text[start..=end])?)
}
