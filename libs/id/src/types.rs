//! Typed ID definitions.
//!
//! Identity IDs are UUID-based; node numbers are small positive integers
//! handed out by the node store.

use crate::define_id;

// =============================================================================
// Cluster
// =============================================================================

define_id!(NodeId);
define_id!(RestrictionId);

// =============================================================================
// Messaging
// =============================================================================

define_id!(EnvelopeId);

// =============================================================================
// Node Numbers
// =============================================================================

/// Owner id meaning "unclaimed": no node currently owns the envelope.
pub const ANY_NODE: i32 = 0;

/// The cluster-unique number assigned to a node when it joins.
///
/// Always positive. Envelope ownership is recorded with this number and
/// `ANY_NODE` (0) marks envelopes nobody owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeNumber(i32);

impl NodeNumber {
    /// Creates a node number, rejecting the `ANY_NODE` sentinel and negatives.
    pub fn new(number: i32) -> Result<Self, crate::IdError> {
        if number <= ANY_NODE {
            return Err(crate::IdError::InvalidNodeNumber(number));
        }
        Ok(Self(number))
    }

    /// Returns the underlying i32 value.
    #[must_use]
    pub const fn value(&self) -> i32 {
        self.0
    }
}

impl std::fmt::Display for NodeNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<i32> for NodeNumber {
    type Error = crate::IdError;

    fn try_from(number: i32) -> Result<Self, Self::Error> {
        Self::new(number)
    }
}

impl From<NodeNumber> for i32 {
    fn from(number: NodeNumber) -> Self {
        number.0
    }
}

impl serde::Serialize for NodeNumber {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_i32(self.0)
    }
}

impl<'de> serde::Deserialize<'de> for NodeNumber {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let number = i32::deserialize(deserializer)?;
        Self::new(number).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_node_id_roundtrip() {
        let id = NodeId::new();
        let parsed: NodeId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_node_id_empty() {
        let result: Result<NodeId, _> = "".parse();
        assert!(matches!(result.unwrap_err(), crate::IdError::Empty));
    }

    #[test]
    fn test_node_id_invalid_uuid() {
        let result: Result<NodeId, _> = "node-1".parse();
        assert!(matches!(result.unwrap_err(), crate::IdError::InvalidUuid(_)));
    }

    #[test]
    fn test_envelope_id_json_is_plain_string() {
        let id = EnvelopeId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let parsed: EnvelopeId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_envelope_ids_are_time_ordered() {
        let first = EnvelopeId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = EnvelopeId::new();
        assert!(first < second);
    }

    #[test]
    fn test_node_number_rejects_any_node() {
        assert_eq!(
            NodeNumber::new(ANY_NODE).unwrap_err(),
            crate::IdError::InvalidNodeNumber(0)
        );
        assert!(NodeNumber::new(-4).is_err());
        assert_eq!(NodeNumber::new(7).unwrap().value(), 7);
    }

    #[test]
    fn test_node_number_deserialize_rejects_zero() {
        let result: Result<NodeNumber, _> = serde_json::from_str("0");
        assert!(result.is_err());
    }

    proptest! {
        #[test]
        fn node_numbers_are_always_positive(n in any::<i32>()) {
            match NodeNumber::new(n) {
                Ok(number) => prop_assert!(number.value() > 0),
                Err(_) => prop_assert!(n <= 0),
            }
        }
    }
}
