use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::CoreError;

/// Name of the tool that owns a payload, e.g. `password-generator`.
///
/// Restricted to ASCII alphanumerics, `-` and `_` so that it can be embedded
/// in derived keys (`{tool}:{user}`, `fallback:{tool}`) without escaping.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ToolName(String);

impl ToolName {
    pub fn new(name: impl Into<String>) -> Result<Self, CoreError> {
        let name = name.into();
        let valid = !name.is_empty()
            && name
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        if valid {
            Ok(Self(name))
        } else {
            Err(CoreError::InvalidToolName(name))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ToolName {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ToolName> for String {
    fn from(value: ToolName) -> Self {
        value.0
    }
}

impl fmt::Debug for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ToolName({})", self.0)
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque user identifier handed in by the identity layer. Trusted as-is.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Result<Self, CoreError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(CoreError::InvalidUserId(id));
        }
        Ok(Self(id))
    }

    /// Identity used when no user is signed in.
    pub fn anonymous() -> Self {
        Self("anonymous".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for UserId {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<UserId> for String {
    fn from(value: UserId) -> Self {
        value.0
    }
}

impl fmt::Debug for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserId({})", self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one stored payload: the `(tool, user)` pair.
///
/// The string form `{tool}:{user}` is the primary key of the local record
/// table. Tool names never contain `:`, so the first colon always splits it.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordId {
    pub tool: ToolName,
    pub user: UserId,
}

impl RecordId {
    pub fn new(tool: ToolName, user: UserId) -> Self {
        Self { tool, user }
    }

    pub fn key(&self) -> String {
        format!("{}:{}", self.tool, self.user)
    }

    pub fn parse(key: &str) -> Result<Self, CoreError> {
        let (tool, user) = key
            .split_once(':')
            .ok_or_else(|| CoreError::InvalidData(format!("malformed record key: {key}")))?;
        Ok(Self {
            tool: ToolName::new(tool)?,
            user: UserId::new(user)?,
        })
    }
}

impl fmt::Debug for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordId({}:{})", self.tool, self.user)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tool, self.user)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ExportId(Uuid);

impl ExportId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for ExportId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ExportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExportId({})", &self.0.to_string()[..8])
    }
}

impl fmt::Display for ExportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_name_rejects_separators() {
        assert!(ToolName::new("color-palette").is_ok());
        assert!(ToolName::new("goal_planner2").is_ok());
        assert!(ToolName::new("").is_err());
        assert!(ToolName::new("a:b").is_err());
        assert!(ToolName::new("has space").is_err());
    }

    #[test]
    fn user_id_rejects_blank() {
        assert!(UserId::new("u-123").is_ok());
        assert!(UserId::new("  ").is_err());
    }

    #[test]
    fn record_key_parses_back() {
        let id = RecordId::new(
            ToolName::new("text-analyzer").unwrap(),
            UserId::new("user:with:colons").unwrap(),
        );
        assert_eq!(id.key(), "text-analyzer:user:with:colons");
        assert_eq!(RecordId::parse(&id.key()).unwrap(), id);
    }

    #[test]
    fn tool_name_deserialization_validates() {
        let ok: Result<ToolName, _> = serde_json::from_str("\"gradient\"");
        assert!(ok.is_ok());
        let bad: Result<ToolName, _> = serde_json::from_str("\"no/slashes\"");
        assert!(bad.is_err());
    }

    #[test]
    fn export_ids_are_unique() {
        let a = ExportId::new();
        let b = ExportId::new();
        assert_ne!(a, b);
        assert_eq!(ExportId::from_bytes(*a.as_bytes()), a);
    }
}
