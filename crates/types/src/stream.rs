//! Stream identifiers.

use crate::error::{TypesError, TypesResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

const SEPARATOR: char = '/';

/// Globally unique stream handle: origin node identity plus a local suffix.
///
/// Rendered as `<node_id>/<suffix>`. The node id is the origin's peer id
/// string, so a receiver can always resolve who owns a stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StreamId {
    node_id: String,
    suffix: String,
}

impl StreamId {
    /// Build a stream id from explicit parts.
    pub fn new(node_id: impl Into<String>, suffix: impl Into<String>) -> TypesResult<Self> {
        let node_id = node_id.into();
        let suffix = suffix.into();
        if node_id.is_empty() || suffix.is_empty() {
            return Err(TypesError::InvalidStreamId(format!("{node_id}{SEPARATOR}{suffix}")));
        }
        if node_id.contains(SEPARATOR) || suffix.contains(SEPARATOR) {
            return Err(TypesError::InvalidStreamId(format!("{node_id}{SEPARATOR}{suffix}")));
        }
        Ok(Self { node_id, suffix })
    }

    /// Mint a fresh stream id owned by `node_id`.
    ///
    /// The suffix comes from a random v4 UUID, so ids minted by the same node
    /// never repeat.
    pub fn random(node_id: &str) -> TypesResult<Self> {
        Self::new(node_id, Uuid::new_v4().simple().to_string())
    }

    /// Identity of the node that originated this stream.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Node-local unique part.
    pub fn suffix(&self) -> &str {
        &self.suffix
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.node_id, SEPARATOR, self.suffix)
    }
}

impl FromStr for StreamId {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (node_id, suffix) = s
            .split_once(SEPARATOR)
            .ok_or_else(|| TypesError::InvalidStreamId(s.to_string()))?;
        Self::new(node_id, suffix)
    }
}

impl TryFrom<String> for StreamId {
    type Error = TypesError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<StreamId> for String {
    fn from(id: StreamId) -> Self {
        id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let id: StreamId = "12D3KooWNode/abc123".parse().unwrap();
        assert_eq!(id.node_id(), "12D3KooWNode");
        assert_eq!(id.suffix(), "abc123");
        assert_eq!(id.to_string(), "12D3KooWNode/abc123");
    }

    #[test]
    fn test_rejects_malformed() {
        assert!("no-separator".parse::<StreamId>().is_err());
        assert!("/suffix".parse::<StreamId>().is_err());
        assert!("node/".parse::<StreamId>().is_err());
        assert!("a/b/c".parse::<StreamId>().is_err());
    }

    #[test]
    fn test_random_ids_are_unique() {
        let a = StreamId::random("node").unwrap();
        let b = StreamId::random("node").unwrap();
        assert_ne!(a, b);
        assert_eq!(a.node_id(), "node");
        assert_eq!(a.suffix().len(), 32);
    }

    #[test]
    fn test_serde_as_string() {
        let id = StreamId::new("node", "s1").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"node/s1\"");
        let back: StreamId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
