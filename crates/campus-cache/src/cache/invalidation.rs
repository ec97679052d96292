//! Invalidation messages and rule sources.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{CacheError, Result};

/// What a remote instance invalidated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum InvalidationTarget {
    Key(String),
    Pattern(String),
}

/// Published on the invalidation channel so peers drop their local copies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationMessage {
    /// Instance that issued the invalidation; it ignores its own messages.
    pub origin: Uuid,
    pub target: InvalidationTarget,
    #[serde(with = "time::serde::rfc3339")]
    pub issued_at: OffsetDateTime,
}

impl InvalidationMessage {
    pub fn key(origin: Uuid, key: impl Into<String>) -> Self {
        Self {
            origin,
            target: InvalidationTarget::Key(key.into()),
            issued_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn pattern(origin: Uuid, pattern: impl Into<String>) -> Self {
        Self {
            origin,
            target: InvalidationTarget::Pattern(pattern.into()),
            issued_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| CacheError::Serialization(e.to_string()))
    }

    pub fn from_json(payload: &str) -> Result<Self> {
        serde_json::from_str(payload).map_err(|e| CacheError::Serialization(e.to_string()))
    }
}

/// Maps a domain event type to the key patterns it invalidates.
pub trait InvalidationRuleSource: Send + Sync {
    fn patterns_for(&self, event_type: &str) -> Vec<String>;
}

impl InvalidationRuleSource for HashMap<String, Vec<String>> {
    fn patterns_for(&self, event_type: &str) -> Vec<String> {
        self.get(event_type).cloned().unwrap_or_default()
    }
}

/// Outcome of one pattern invalidation across both tiers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationReport {
    pub pattern: String,
    pub local_removed: usize,
    /// `None` when the distributed tier is disabled or the delete failed.
    pub distributed_removed: Option<u64>,
    pub distributed_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_wire_format() {
        let origin = Uuid::nil();
        let mut message = InvalidationMessage::pattern(origin, "user:1:*");
        message.issued_at = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();

        let json: serde_json::Value = serde_json::from_str(&message.to_json().unwrap()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "origin": "00000000-0000-0000-0000-000000000000",
                "target": { "kind": "pattern", "value": "user:1:*" },
                "issuedAt": "2023-11-14T22:13:20Z"
            })
        );

        let parsed = InvalidationMessage::from_json(&message.to_json().unwrap()).unwrap();
        assert_eq!(parsed, message);
    }

    #[test]
    fn test_malformed_message() {
        assert!(matches!(
            InvalidationMessage::from_json("user:1"),
            Err(CacheError::Serialization(_))
        ));
    }

    #[test]
    fn test_map_rule_source() {
        let mut rules: HashMap<String, Vec<String>> = HashMap::new();
        rules.insert(
            "enrollment.changed".into(),
            vec!["course:*:roster".into(), "student:*:schedule".into()],
        );

        assert_eq!(rules.patterns_for("enrollment.changed").len(), 2);
        assert!(rules.patterns_for("grade.posted").is_empty());
    }
}
