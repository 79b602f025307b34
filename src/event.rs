//! Event Data Model
//!
//! Defines the structured event record accepted by the pipeline: a name, a
//! tenant token, a priority, a timestamp, and a map of typed, PII-tagged
//! properties. This is the only shape an instrumented application hands to
//! the SDK; everything downstream (policy, serialization, packaging) reads
//! from this type without mutating its invariants.

use bitflags::bitflags;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Upload priority, ordered `Off < Background < Normal < High < Immediate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    Off,
    Background,
    Normal,
    High,
    Immediate,
}

impl Priority {
    pub const ALL: [Priority; 5] = [
        Priority::Off,
        Priority::Background,
        Priority::Normal,
        Priority::High,
        Priority::Immediate,
    ];

    /// Lowest-first iterator of the priorities below and including `self`,
    /// used by the offline store's eviction ordering.
    pub fn at_or_below(self) -> impl Iterator<Item = Priority> {
        Priority::ALL.into_iter().filter(move |p| *p <= self)
    }
}

/// Classification of a property's PII sensitivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PiiKind {
    None,
    DistinguishedName,
    GenericData,
    Ipv4,
    Ipv6,
    MailSubject,
    Phone,
    QueryString,
    Sip,
    Smtp,
    Identity,
    Uri,
    Fqdn,
}

impl PiiKind {
    pub fn is_pii(self) -> bool {
        !matches!(self, PiiKind::None)
    }
}

bitflags! {
    /// Per-event policy bits controlling downstream handling.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct PolicyBits: u8 {
        /// Retain PII-tagged properties; the serializer decides how to emit them.
        const MARK_PII = 0b0000_0001;
        /// Strip all properties whose PII kind is not `None`.
        const DROP_PII = 0b0000_0010;
    }
}

impl Default for PolicyBits {
    fn default() -> Self {
        PolicyBits::empty()
    }
}

/// A single typed property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    String(String),
    Int64(i64),
    Float64(f64),
    Bool(bool),
    Guid(Uuid),
    /// 100-nanosecond ticks since the .NET epoch, matching the original wire format.
    TimeTicks(i64),
}

/// A property value together with its PII classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaggedValue {
    pub value: Value,
    pub pii: PiiKind,
}

impl TaggedValue {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            pii: PiiKind::None,
        }
    }

    pub fn with_pii(value: Value, pii: PiiKind) -> Self {
        Self { value, pii }
    }
}

/// Property name reserved for the privacy tag UTC mode checks for.
pub const PRIVACY_TAG_PROPERTY: &str = "privacy_tag";

/// A structured telemetry event submitted by the host application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    pub tenant_token: String,
    pub priority: Priority,
    pub timestamp: DateTime<Utc>,
    pub properties: BTreeMap<String, TaggedValue>,
    pub policy: PolicyBits,
    /// Verbosity level the caller assigned this event, checked against
    /// `minimumTraceLevel`/`traceLevelMask` by the policy gate.
    pub trace_level: u8,
}

/// Error returned by [`Event::new`] when a structural invariant is violated.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EventValidationError {
    #[error("event name {0:?} does not match [A-Za-z0-9._-]+")]
    InvalidName(String),
    #[error("tenant token must not be empty")]
    EmptyTenantToken,
}

impl Event {
    pub fn new(
        name: impl Into<String>,
        tenant_token: impl Into<String>,
        priority: Priority,
        timestamp: DateTime<Utc>,
    ) -> Result<Self, EventValidationError> {
        let name = name.into();
        let tenant_token = tenant_token.into();
        if !is_valid_event_name(&name) {
            return Err(EventValidationError::InvalidName(name));
        }
        if tenant_token.is_empty() {
            return Err(EventValidationError::EmptyTenantToken);
        }
        Ok(Self {
            name,
            tenant_token,
            priority,
            timestamp,
            properties: BTreeMap::new(),
            policy: PolicyBits::empty(),
            trace_level: 0,
        })
    }

    pub fn set_property(&mut self, name: impl Into<String>, value: TaggedValue) {
        self.properties.insert(name.into(), value);
    }

    pub fn with_property(mut self, name: impl Into<String>, value: TaggedValue) -> Self {
        self.set_property(name, value);
        self
    }

    pub fn with_policy(mut self, policy: PolicyBits) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_trace_level(mut self, trace_level: u8) -> Self {
        self.trace_level = trace_level;
        self
    }

    pub fn has_privacy_tag(&self) -> bool {
        self.properties.contains_key(PRIVACY_TAG_PROPERTY)
    }
}

fn is_valid_event_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn priority_orders_low_to_high() {
        assert!(Priority::Off < Priority::Background);
        assert!(Priority::Background < Priority::Normal);
        assert!(Priority::Normal < Priority::High);
        assert!(Priority::High < Priority::Immediate);
    }

    #[test]
    fn rejects_invalid_names() {
        assert!(Event::new("bad name!", "T1", Priority::Normal, ts()).is_err());
        assert!(Event::new("", "T1", Priority::Normal, ts()).is_err());
    }

    #[test]
    fn rejects_empty_tenant_token() {
        assert!(Event::new("Good.Name-1", "", Priority::Normal, ts()).is_err());
    }

    #[test]
    fn accepts_valid_event() {
        let event = Event::new("App.Started", "T1", Priority::Normal, ts()).unwrap();
        assert_eq!(event.name, "App.Started");
        assert!(!event.has_privacy_tag());
    }

    #[test]
    fn drop_pii_policy_round_trips_through_bitflags() {
        let policy = PolicyBits::DROP_PII | PolicyBits::MARK_PII;
        assert!(policy.contains(PolicyBits::DROP_PII));
        assert!(policy.contains(PolicyBits::MARK_PII));
    }
}
