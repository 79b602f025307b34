//! Internal diagnostics
//!
//! When `stats.interval_seconds > 0`, the context periodically assembles a
//! snapshot of drop/retry/oversize counters and current queue depth, and
//! resubmits it through the same pipeline entry point as an ordinary
//! `Normal`-priority event — closing the loop described by the error
//! propagation policy without a separate side channel.

use crate::config::StatsConfig;
use crate::event::{Event, Priority, TaggedValue, Value};
use crate::pipeline::policy_gate::DropCountersSnapshot;
use chrono::Utc;

const STATS_EVENT_NAME: &str = "sdk.internal.stats";

/// Point-in-time counters fed into one diagnostics snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatsSnapshot {
    pub drops: DropCountersSnapshot,
    pub queue_len: u64,
    pub disk_full_evictions: u64,
    pub dropped_max_retries: u64,
    pub oversize_dropped: u64,
    pub accepted: u64,
    pub rejected_permanent: u64,
}

/// Builds internal-diagnostics events tagged with the configured stats
/// tenant token.
pub struct StatsReporter {
    token: String,
}

impl StatsReporter {
    pub fn new(config: StatsConfig) -> Self {
        let token = if cfg!(debug_assertions) {
            config.token_int
        } else {
            config.token_prod
        };
        Self { token }
    }

    /// Builds the snapshot event, or `None` if no stats token was
    /// configured (diagnostics would have nowhere to route to).
    pub fn build_event(&self, snapshot: StatsSnapshot) -> Option<Event> {
        if self.token.is_empty() {
            return None;
        }

        let event = Event::new(STATS_EVENT_NAME, self.token.clone(), Priority::Normal, Utc::now())
            .ok()?
            .with_property("drops.priorityOff", TaggedValue::new(Value::Int64(snapshot.drops.priority_off as i64)))
            .with_property(
                "drops.traceLevelFiltered",
                TaggedValue::new(Value::Int64(snapshot.drops.trace_level_filtered as i64)),
            )
            .with_property(
                "drops.sampled",
                TaggedValue::new(Value::Int64(snapshot.drops.sampled as i64)),
            )
            .with_property(
                "drops.tenantNotAllowed",
                TaggedValue::new(Value::Int64(snapshot.drops.tenant_not_allowed as i64)),
            )
            .with_property(
                "drops.missingPrivacyTag",
                TaggedValue::new(Value::Int64(snapshot.drops.missing_privacy_tag as i64)),
            )
            .with_property("queue.len", TaggedValue::new(Value::Int64(snapshot.queue_len as i64)))
            .with_property(
                "store.diskFullEvictions",
                TaggedValue::new(Value::Int64(snapshot.disk_full_evictions as i64)),
            )
            .with_property(
                "store.droppedMaxRetries",
                TaggedValue::new(Value::Int64(snapshot.dropped_max_retries as i64)),
            )
            .with_property(
                "transmitter.oversizeDropped",
                TaggedValue::new(Value::Int64(snapshot.oversize_dropped as i64)),
            )
            .with_property("transmitter.accepted", TaggedValue::new(Value::Int64(snapshot.accepted as i64)))
            .with_property(
                "transmitter.rejectedPermanent",
                TaggedValue::new(Value::Int64(snapshot.rejected_permanent as i64)),
            );

        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_event_returns_none_without_a_configured_token() {
        let reporter = StatsReporter::new(StatsConfig {
            interval_seconds: 30,
            token_int: String::new(),
            token_prod: String::new(),
        });
        assert!(reporter.build_event(StatsSnapshot::default()).is_none());
    }

    #[test]
    fn build_event_carries_counters_as_properties() {
        let reporter = StatsReporter::new(StatsConfig {
            interval_seconds: 30,
            token_int: "STATS-TOKEN".to_string(),
            token_prod: String::new(),
        });
        let snapshot = StatsSnapshot {
            queue_len: 3,
            accepted: 7,
            ..StatsSnapshot::default()
        };
        let event = reporter.build_event(snapshot).unwrap();
        assert_eq!(event.tenant_token, "STATS-TOKEN");
        assert_eq!(event.properties.get("queue.len").unwrap().value, Value::Int64(3));
        assert_eq!(
            event.properties.get("transmitter.accepted").unwrap().value,
            Value::Int64(7)
        );
    }
}
