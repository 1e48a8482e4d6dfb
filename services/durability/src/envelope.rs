//! Envelope metadata persisted by the inbox and outbox.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use wolverine_id::{EnvelopeId, ANY_NODE};

/// Lifecycle state of a persisted envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnvelopeStatus {
    Incoming,
    Scheduled,
    Handled,
    Outgoing,
}

impl EnvelopeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Incoming => "Incoming",
            Self::Scheduled => "Scheduled",
            Self::Handled => "Handled",
            Self::Outgoing => "Outgoing",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Incoming" => Some(Self::Incoming),
            "Scheduled" => Some(Self::Scheduled),
            "Handled" => Some(Self::Handled),
            "Outgoing" => Some(Self::Outgoing),
            _ => None,
        }
    }
}

impl std::fmt::Display for EnvelopeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message in flight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Dedup key.
    pub id: EnvelopeId,
    pub status: EnvelopeStatus,
    /// Node number working the envelope, `ANY_NODE` when unclaimed.
    pub owner_id: i32,
    /// Where an outgoing envelope is sent.
    pub destination: Option<String>,
    /// Listener address an incoming envelope arrived on.
    pub received_at: Option<String>,
    /// Service that sent the envelope.
    pub source: Option<String>,
    /// When a scheduled envelope becomes due.
    pub scheduled_time: Option<DateTime<Utc>>,
    pub attempts: i32,
    pub message_type: String,
    /// Opaque serialized message body.
    pub data: Vec<u8>,
    /// When a handled row may be purged.
    pub keep_until: Option<DateTime<Utc>>,
    /// Delivery deadline.
    pub deliver_by: Option<DateTime<Utc>>,
    pub sent_at: DateTime<Utc>,
    pub tenant_id: Option<String>,
}

impl Envelope {
    /// Creates an unowned incoming envelope.
    pub fn new(message_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            id: EnvelopeId::new(),
            status: EnvelopeStatus::Incoming,
            owner_id: ANY_NODE,
            destination: None,
            received_at: None,
            source: None,
            scheduled_time: None,
            attempts: 0,
            message_type: message_type.into(),
            data,
            keep_until: None,
            deliver_by: None,
            sent_at: Utc::now(),
            tenant_id: None,
        }
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn deliver_by(mut self, deadline: DateTime<Utc>) -> Self {
        self.deliver_by = Some(deadline);
        self
    }

    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.status = EnvelopeStatus::Scheduled;
        self.scheduled_time = Some(at);
        self
    }

    pub fn owned_by(mut self, owner_id: i32) -> Self {
        self.owner_id = owner_id;
        self
    }

    /// True once the delivery deadline has passed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.deliver_by.is_some_and(|deadline| deadline <= now)
    }

    /// True if the envelope is due strictly after `now`.
    pub fn is_scheduled_for_later(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_time.is_some_and(|at| at > now)
    }

    /// Tenant key with absent mapped to empty.
    pub fn tenant_key(&self) -> &str {
        self.tenant_id.as_deref().unwrap_or("")
    }
}

/// Failure captured when an envelope is dead-lettered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionInfo {
    pub exception_type: String,
    pub message: String,
}

impl ExceptionInfo {
    pub fn new(exception_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            exception_type: exception_type.into(),
            message: message.into(),
        }
    }
}

/// A dead-lettered envelope with its captured failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterEnvelope {
    pub envelope: Envelope,
    pub exception: ExceptionInfo,
    /// Marked by an operator for replay into the inbox.
    pub replayable: bool,
}

/// Count of dead letters per listener, message type and failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterSummary {
    pub tenant_id: Option<String>,
    pub received_at: Option<String>,
    pub message_type: String,
    pub exception_type: String,
    pub count: i64,
}

/// Filter for dead-letter queries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeadLetterQuery {
    pub tenant_id: Option<String>,
    pub message_type: Option<String>,
    pub exception_type: Option<String>,
    pub received_at: Option<String>,
    pub limit: Option<usize>,
}

impl DeadLetterQuery {
    pub fn matches(&self, dead_letter: &DeadLetterEnvelope) -> bool {
        let envelope = &dead_letter.envelope;
        self.message_type
            .as_ref()
            .is_none_or(|t| t == &envelope.message_type)
            && self
                .exception_type
                .as_ref()
                .is_none_or(|t| t == &dead_letter.exception.exception_type)
            && self
                .received_at
                .as_ref()
                .is_none_or(|r| Some(r) == envelope.received_at.as_ref())
    }
}

/// Row counts per envelope state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedCounts {
    pub incoming: i64,
    pub scheduled: i64,
    pub handled: i64,
    pub outgoing: i64,
    pub dead_letter: i64,
}

impl std::ops::Add for PersistedCounts {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            incoming: self.incoming + rhs.incoming,
            scheduled: self.scheduled + rhs.scheduled,
            handled: self.handled + rhs.handled,
            outgoing: self.outgoing + rhs.outgoing,
            dead_letter: self.dead_letter + rhs.dead_letter,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_envelope_is_unowned() {
        let envelope = Envelope::new("Ping", b"{}".to_vec());
        assert_eq!(envelope.owner_id, ANY_NODE);
        assert_eq!(envelope.status, EnvelopeStatus::Incoming);
        assert_eq!(envelope.tenant_key(), "");
    }

    #[test]
    fn test_expiry() {
        let now = Utc::now();
        let envelope = Envelope::new("Ping", vec![]).deliver_by(now - chrono::Duration::seconds(1));
        assert!(envelope.is_expired(now));
        assert!(!Envelope::new("Ping", vec![]).is_expired(now));
    }

    #[test]
    fn test_scheduled_for_later() {
        let now = Utc::now();
        let later = Envelope::new("Ping", vec![]).scheduled_for(now + chrono::Duration::minutes(1));
        assert_eq!(later.status, EnvelopeStatus::Scheduled);
        assert!(later.is_scheduled_for_later(now));
        assert!(!later.is_scheduled_for_later(now + chrono::Duration::minutes(2)));
    }

    #[test]
    fn test_status_strings() {
        for status in [
            EnvelopeStatus::Incoming,
            EnvelopeStatus::Scheduled,
            EnvelopeStatus::Handled,
            EnvelopeStatus::Outgoing,
        ] {
            assert_eq!(EnvelopeStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn test_counts_add() {
        let a = PersistedCounts {
            incoming: 1,
            outgoing: 2,
            ..Default::default()
        };
        let b = PersistedCounts {
            incoming: 3,
            dead_letter: 1,
            ..Default::default()
        };
        let sum = a + b;
        assert_eq!(sum.incoming, 4);
        assert_eq!(sum.outgoing, 2);
        assert_eq!(sum.dead_letter, 1);
    }

    #[test]
    fn test_dead_letter_query_matches() {
        let dead_letter = DeadLetterEnvelope {
            envelope: Envelope::new("Ping", vec![]),
            exception: ExceptionInfo::new("Timeout", "too slow"),
            replayable: false,
        };
        assert!(DeadLetterQuery::default().matches(&dead_letter));
        assert!(DeadLetterQuery {
            exception_type: Some("Timeout".to_string()),
            ..Default::default()
        }
        .matches(&dead_letter));
        assert!(!DeadLetterQuery {
            message_type: Some("Pong".to_string()),
            ..Default::default()
        }
        .matches(&dead_letter));
    }
}
