use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::ids::ToolName;

pub const EXPORT_FORMAT_VERSION: &str = "1.0";

/// Downloadable export of one tool's payload.
///
/// ```json
/// { "tool": "...", "exportDate": "...", "version": "1.0", "data": ... }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportEnvelope {
    pub tool: ToolName,
    pub export_date: DateTime<Utc>,
    pub version: String,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ImportFormatError {
    #[error("import file is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("import file must be a JSON object")]
    NotAnObject,

    #[error("import file belongs to tool {found:?}, expected {expected:?}")]
    ToolMismatch { expected: String, found: String },

    #[error("import file has no data")]
    MissingData,
}

impl ExportEnvelope {
    pub fn new(tool: ToolName, export_date: DateTime<Utc>, data: Value) -> Self {
        Self {
            tool,
            export_date,
            version: EXPORT_FORMAT_VERSION.to_string(),
            data,
        }
    }

    pub fn to_json_pretty(&self) -> Result<String, crate::CoreError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| crate::CoreError::Serialization(e.to_string()))
    }

    /// Validate an import file for `expected` and return its payload.
    ///
    /// Only `tool` and `data` are checked; `exportDate` and `version` are
    /// informational. An explicit `"data": null` is a valid payload.
    pub fn parse_for(expected: &ToolName, text: &str) -> Result<Value, ImportFormatError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| ImportFormatError::InvalidJson(e.to_string()))?;
        Self::payload_for(expected, value)
    }

    pub fn payload_for(expected: &ToolName, value: Value) -> Result<Value, ImportFormatError> {
        let Value::Object(mut fields) = value else {
            return Err(ImportFormatError::NotAnObject);
        };

        let found = match fields.get("tool") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        };
        if found != expected.as_str() {
            return Err(ImportFormatError::ToolMismatch {
                expected: expected.to_string(),
                found,
            });
        }

        fields.remove("data").ok_or(ImportFormatError::MissingData)
    }
}
