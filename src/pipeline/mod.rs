//! Event Pipeline
//!
//! The staged dataflow that takes a submitted [`crate::event::Event`] from
//! policy evaluation through serialization. Packaging into framed payloads
//! happens downstream in [`crate::transport::transmitter`], which owns the
//! [`packager::Packager`] instance shared across one dispatch attempt.

pub mod packager;
pub mod policy_gate;
pub mod serializer;

use crate::clock_skew::ClockSkew;
use crate::error::TelemetryError;
use crate::event::Event;
use crate::pipeline::policy_gate::{DropReason, PolicyGate};
use crate::pipeline::serializer::{SerializedRecord, Serializer};
use std::sync::Arc;

/// Runs an event through the policy gate and serializer, the two pipeline
/// stages that happen synchronously on submission before a record reaches
/// the offline store.
pub struct Pipeline {
    policy_gate: PolicyGate,
    serializer: Arc<dyn Serializer>,
    clock_skew: Arc<ClockSkew>,
}

/// Outcome of running an event through the pipeline's ingest stages.
pub enum PipelineOutcome {
    Record(SerializedRecord),
    Dropped(DropReason),
    SerializeFailed(TelemetryError),
}

impl Pipeline {
    pub fn new(
        config: &crate::config::Config,
        serializer: Arc<dyn Serializer>,
        clock_skew: Arc<ClockSkew>,
    ) -> Self {
        Self {
            policy_gate: PolicyGate::new(config),
            serializer,
            clock_skew,
        }
    }

    pub fn policy_gate(&self) -> &PolicyGate {
        &self.policy_gate
    }

    /// Applies the currently recorded clock-skew offset to the event's
    /// timestamp, then runs it through the policy gate (using the trace
    /// level the caller tagged it with) and the serializer.
    pub fn submit(&self, mut event: Event) -> PipelineOutcome {
        event.timestamp = self.clock_skew.apply(event.timestamp);
        let trace_level = event.trace_level;
        match self.policy_gate.evaluate(trace_level, event) {
            Err(reason) => PipelineOutcome::Dropped(reason),
            Ok(event) => match self.serializer.serialize(&event) {
                Ok(record) => PipelineOutcome::Record(record),
                Err(err) => PipelineOutcome::SerializeFailed(err),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigBuilder;
    use crate::event::{Event, Priority};
    use crate::pipeline::serializer::CompactSerializer;
    use chrono::Utc;

    fn base_config() -> crate::config::Config {
        ConfigBuilder::new()
            .event_collector_uri("https://collector.example.com")
            .primary_token("T1")
            .build()
            .unwrap()
    }

    #[test]
    fn accepted_event_produces_a_serialized_record() {
        let pipeline = Pipeline::new(&base_config(), Arc::new(CompactSerializer), ClockSkew::new());
        let event = Event::new("App.Started", "T1", Priority::Normal, Utc::now()).unwrap();
        match pipeline.submit(event) {
            PipelineOutcome::Record(record) => assert_eq!(record.tenant_token, "T1"),
            _ => panic!("expected a record"),
        }
    }

    #[test]
    fn off_priority_event_is_dropped_before_serialization() {
        let pipeline = Pipeline::new(&base_config(), Arc::new(CompactSerializer), ClockSkew::new());
        let event = Event::new("App.Started", "T1", Priority::Off, Utc::now()).unwrap();
        match pipeline.submit(event) {
            PipelineOutcome::Dropped(DropReason::PriorityOff) => {}
            _ => panic!("expected a drop"),
        }
    }

    #[test]
    fn trace_level_on_the_event_reaches_the_policy_gate() {
        let mut config = base_config();
        config.trace_level_mask = 0b0010; // only level 1 passes
        let pipeline = Pipeline::new(&config, Arc::new(CompactSerializer), ClockSkew::new());

        let filtered = Event::new("App.Started", "T1", Priority::Normal, Utc::now())
            .unwrap()
            .with_trace_level(2);
        assert!(matches!(
            pipeline.submit(filtered),
            PipelineOutcome::Dropped(DropReason::TraceLevelFiltered)
        ));

        let allowed = Event::new("App.Started", "T1", Priority::Normal, Utc::now())
            .unwrap()
            .with_trace_level(1);
        assert!(matches!(pipeline.submit(allowed), PipelineOutcome::Record(_)));
    }

    #[test]
    fn clock_skew_offset_shifts_the_serialized_timestamp() {
        let clock_skew = ClockSkew::new();
        clock_skew.set_offset_ms(60_000);
        let pipeline = Pipeline::new(&base_config(), Arc::new(CompactSerializer), clock_skew);

        let now = Utc::now();
        let name = "App.Started";
        let event = Event::new(name, "T1", Priority::Normal, now).unwrap();
        match pipeline.submit(event) {
            PipelineOutcome::Record(record) => {
                let ts_offset = 4 + name.len();
                let mut millis_bytes = [0u8; 8];
                millis_bytes.copy_from_slice(&record.bytes[ts_offset..ts_offset + 8]);
                let encoded_millis = i64::from_le_bytes(millis_bytes);
                assert_eq!(encoded_millis, (now + chrono::Duration::milliseconds(60_000)).timestamp_millis());
            }
            _ => panic!("expected a record"),
        }
    }
}
