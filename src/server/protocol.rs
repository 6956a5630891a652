//! Wire format of the analysis endpoint.
//!
//! Key names and the fixed error message are shared with existing clients
//! and must not change.

use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::Value;

/// Request key holding the document to analyze.
pub const PRIVACY_POLICY_KEY: &str = "privacy_policy";

/// Response key holding the generated text.
pub const ANALYSIS_KEY: &str = "analysis";

/// Error response key holding a human-readable message.
pub const MESSAGE_KEY: &str = "message";

/// Error response key holding a stable machine-readable kind (5xx only).
pub const ERROR_KEY: &str = "error";

/// Body of every rejected request.
pub const ERROR_MESSAGE: &str = "Missing privacy policy in request body";

/// Instruction placed in front of every document.
pub const PROMPT_PREFIX: &str = "Analyze this privacy policy and give me a score from 1 to 10: ";

/// Successful analysis.
#[derive(Debug, Clone)]
pub struct AnalyzeResponse {
    pub analysis: String,
}

impl Serialize for AnalyzeResponse {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(ANALYSIS_KEY, &self.analysis)?;
        map.end()
    }
}

/// Error body. `error` is only present for server-side failures.
#[derive(Debug, Clone)]
pub struct ErrorResponse {
    pub message: String,
    pub error: Option<String>,
}

impl Serialize for ErrorResponse {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let len = 1 + usize::from(self.error.is_some());
        let mut map = serializer.serialize_map(Some(len))?;
        map.serialize_entry(MESSAGE_KEY, &self.message)?;
        if let Some(kind) = &self.error {
            map.serialize_entry(ERROR_KEY, kind)?;
        }
        map.end()
    }
}

/// Pull the document out of a raw request body.
///
/// Returns `None` unless the body is a JSON object whose `privacy_policy`
/// member is a string. The content type is not looked at.
pub fn extract_document(body: &[u8]) -> Option<String> {
    // Parsed as a `Value` rather than a struct: serde would also accept a
    // one-element JSON array for a one-field struct.
    let value: Value = serde_json::from_slice(body).ok()?;
    value
        .as_object()?
        .get(PRIVACY_POLICY_KEY)?
        .as_str()
        .map(str::to_owned)
}

pub fn build_prompt(document: &str) -> String {
    let mut prompt = String::with_capacity(PROMPT_PREFIX.len() + document.len());
    prompt.push_str(PROMPT_PREFIX);
    prompt.push_str(document);
    prompt
}
