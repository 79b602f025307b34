//! Policy Gate
//!
//! First pipeline stage: applies trace-level filtering, tenant acceptance,
//! PII policy, and UTC-mode enforcement to an incoming [`Event`] before it
//! reaches the serializer. A drop is not an error — each reason increments
//! a counter the caller can inspect for diagnostics.

use crate::config::Config;
use crate::event::{Event, PolicyBits, Priority};
use dashmap::DashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Why the policy gate dropped an event, used to label the drop counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    PriorityOff,
    TraceLevelFiltered,
    Sampled,
    TenantNotAllowed,
    MissingPrivacyTag,
}

/// Tracks per-reason drop counts for diagnostics.
#[derive(Debug, Default)]
pub struct DropCounters {
    priority_off: AtomicU64,
    trace_level_filtered: AtomicU64,
    sampled: AtomicU64,
    tenant_not_allowed: AtomicU64,
    missing_privacy_tag: AtomicU64,
}

impl DropCounters {
    fn increment(&self, reason: DropReason) {
        let counter = match reason {
            DropReason::PriorityOff => &self.priority_off,
            DropReason::TraceLevelFiltered => &self.trace_level_filtered,
            DropReason::Sampled => &self.sampled,
            DropReason::TenantNotAllowed => &self.tenant_not_allowed,
            DropReason::MissingPrivacyTag => &self.missing_privacy_tag,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DropCountersSnapshot {
        DropCountersSnapshot {
            priority_off: self.priority_off.load(Ordering::Relaxed),
            trace_level_filtered: self.trace_level_filtered.load(Ordering::Relaxed),
            sampled: self.sampled.load(Ordering::Relaxed),
            tenant_not_allowed: self.tenant_not_allowed.load(Ordering::Relaxed),
            missing_privacy_tag: self.missing_privacy_tag.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`DropCounters`], cheap to pass around for stats reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DropCountersSnapshot {
    pub priority_off: u64,
    pub trace_level_filtered: u64,
    pub sampled: u64,
    pub tenant_not_allowed: u64,
    pub missing_privacy_tag: u64,
}

/// Applies trace-level, sampling, tenant, PII, and UTC-mode policy to
/// incoming events.
pub struct PolicyGate {
    minimum_trace_level: u8,
    trace_level_mask: u32,
    sample_rate: u8,
    multi_tenant_enabled: bool,
    allowed_tenants: DashMap<String, ()>,
    utc_active: bool,
    counters: DropCounters,
}

impl PolicyGate {
    pub fn new(config: &Config) -> Self {
        let allowed_tenants = DashMap::new();
        for tenant in &config.allowed_tenants {
            allowed_tenants.insert(tenant.clone(), ());
        }
        allowed_tenants.insert(config.primary_token.clone(), ());

        Self {
            minimum_trace_level: config.minimum_trace_level,
            trace_level_mask: config.trace_level_mask,
            sample_rate: config.sampling.rate,
            multi_tenant_enabled: config.multi_tenant_enabled,
            allowed_tenants,
            utc_active: config.utc.active,
            counters: DropCounters::default(),
        }
    }

    pub fn counters(&self) -> &DropCounters {
        &self.counters
    }

    /// Evaluates the event against trace level, sampling, tenant acceptance,
    /// and UTC-mode policy, applies PII policy in place, and returns the
    /// (possibly modified) event or the reason it was dropped.
    pub fn evaluate(&self, trace_level: u8, mut event: Event) -> Result<Event, DropReason> {
        if event.priority == Priority::Off {
            self.counters.increment(DropReason::PriorityOff);
            return Err(DropReason::PriorityOff);
        }

        if trace_level < self.minimum_trace_level
            || (self.trace_level_mask & (1 << trace_level.min(31))) == 0
        {
            self.counters.increment(DropReason::TraceLevelFiltered);
            debug!(event = %event.name, trace_level, "event dropped by trace-level filter");
            return Err(DropReason::TraceLevelFiltered);
        }

        if self.sample_rate < 100 && sample_bucket(&event.name) >= self.sample_rate {
            self.counters.increment(DropReason::Sampled);
            debug!(event = %event.name, rate = self.sample_rate, "event dropped by sampling");
            return Err(DropReason::Sampled);
        }

        if !self.multi_tenant_enabled && !self.allowed_tenants.contains_key(&event.tenant_token) {
            self.counters.increment(DropReason::TenantNotAllowed);
            debug!(event = %event.name, tenant = %event.tenant_token, "event dropped: tenant not allowed");
            return Err(DropReason::TenantNotAllowed);
        }

        apply_pii_policy(&mut event);

        if self.utc_active && !event.has_privacy_tag() {
            self.counters.increment(DropReason::MissingPrivacyTag);
            debug!(event = %event.name, "event dropped: UTC mode requires a privacy tag");
            return Err(DropReason::MissingPrivacyTag);
        }

        Ok(event)
    }
}

/// Deterministic bucket in `0..100` for an event name, used to decide
/// whether it falls inside the configured sampling rate.
fn sample_bucket(name: &str) -> u8 {
    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    (hasher.finish() % 100) as u8
}

fn apply_pii_policy(event: &mut Event) {
    if event.policy.contains(PolicyBits::DROP_PII) {
        event
            .properties
            .retain(|_, tagged| !tagged.pii.is_pii());
    }
    // MARK_PII requires no action here: tags are left in place for the
    // serializer, which decides how to render them on the wire.
}
