//! Work items: the units of input carried through the pipeline.
//!
//! A work item is immutable once created. Identity is the (source, item)
//! key pair, e.g. a company ticker plus a filing id.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Identity key for a work item: source-domain id plus item id.
///
/// Rendered as `SOURCE:ITEM`, e.g. `BHP:2024-FY-results`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkItemKey {
    /// Source-domain identifier (e.g. company ticker)
    pub source: String,

    /// Item identifier within the source (e.g. filing id)
    pub item: String,
}

impl WorkItemKey {
    /// Create a new key
    pub fn new(source: impl Into<String>, item: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            item: item.into(),
        }
    }
}

impl fmt::Display for WorkItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.item)
    }
}

impl FromStr for WorkItemKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((source, item)) if !source.is_empty() && !item.is_empty() => {
                Ok(Self::new(source, item))
            }
            _ => Err(format!("invalid work item key '{}' (expected SOURCE:ITEM)", s)),
        }
    }
}

/// A unit of input to be carried through the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    /// Identity key (unique across the deployment)
    pub key: WorkItemKey,

    /// When the item was ingested
    pub created_at: DateTime<Utc>,

    /// Opaque payload handed to the first stage
    pub payload: serde_json::Value,
}

impl WorkItem {
    /// Create a new work item with the current timestamp
    pub fn new(key: WorkItemKey, payload: serde_json::Value) -> Self {
        Self {
            key,
            created_at: Utc::now(),
            payload,
        }
    }

    /// Short content digest of the payload (16 hex chars)
    pub fn payload_digest(&self) -> String {
        digest_value(&self.payload)
    }
}

/// Hash a JSON value to a short digest (first 8 bytes of SHA256, hex)
pub fn digest_value(value: &serde_json::Value) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let result = hasher.finalize();
    hex::encode(&result[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_display_and_parse() {
        let key = WorkItemKey::new("BHP", "2024-FY-results");
        assert_eq!(key.to_string(), "BHP:2024-FY-results");

        let parsed: WorkItemKey = "BHP:2024-FY-results".parse().unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn test_key_parse_rejects_malformed() {
        assert!("no-separator".parse::<WorkItemKey>().is_err());
        assert!(":missing-source".parse::<WorkItemKey>().is_err());
        assert!("missing-item:".parse::<WorkItemKey>().is_err());
    }

    #[test]
    fn test_payload_digest_stability() {
        let item = WorkItem::new(
            WorkItemKey::new("BHP", "doc-1"),
            serde_json::json!({"url": "https://example.com/doc-1.pdf"}),
        );
        let again = WorkItem::new(item.key.clone(), item.payload.clone());

        assert_eq!(item.payload_digest(), again.payload_digest());
        assert_eq!(item.payload_digest().len(), 16);
    }
}
