//! Lifecycle / Context
//!
//! Owns everything a single logical logger needs: the event pipeline, the
//! offline store, the transmitter, and the viewer bus. A process is free to
//! construct as many `Context`s as it wants — the crate never assumes a
//! singleton — but [`initialize`] provides a thin, idempotent convenience
//! façade over a single lazily-created instance for applications that only
//! want one.

use crate::clock_skew::ClockSkew;
use crate::config::Config;
use crate::error::{TelemetryError, TelemetryResult};
use crate::event::Event;
use crate::pipeline::serializer::Serializer;
use crate::pipeline::{Pipeline, PipelineOutcome};
use crate::stats::{StatsReporter, StatsSnapshot};
use crate::store::OfflineStore;
use crate::transport::{HttpTransport, Transmitter};
use crate::viewer::{Viewer, ViewerBus};
use once_cell::sync::OnceCell;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// A fully wired logger: pipeline, store, transmitter, and viewer bus bound
/// to one [`Config`]. Owns two background tasks: the transmitter's dispatch
/// scheduler, and (when `stats.interval_seconds > 0`) a periodic stats
/// snapshot tick. Both are aborted on teardown or when the logger is
/// dropped.
pub struct Logger {
    config: Config,
    pipeline: Pipeline,
    store: Arc<OfflineStore>,
    transmitter: Arc<Transmitter>,
    viewer_bus: Arc<ViewerBus>,
    stats: Option<StatsReporter>,
    dispatch_scheduler: JoinHandle<()>,
    stats_scheduler: Option<JoinHandle<()>>,
}

impl Drop for Logger {
    fn drop(&mut self) {
        self.dispatch_scheduler.abort();
        if let Some(handle) = &self.stats_scheduler {
            handle.abort();
        }
    }
}

impl Logger {
    /// Submits an event through the policy gate, serializer, and into the
    /// offline store. Never returns an error to the caller for priorities
    /// `>= High`; lower priorities may be refused under disk pressure,
    /// reported as `false`.
    pub fn log_event(&self, event: Event) -> bool {
        match self.pipeline.submit(event) {
            PipelineOutcome::Record(record) => match self.store.put(&record) {
                Ok(_) => true,
                Err(TelemetryError::StoreFull { priority, reason }) => {
                    warn!(?priority, %reason, "event refused by offline store");
                    false
                }
                Err(err) => {
                    warn!(error = %err, "unexpected error enqueueing event");
                    false
                }
            },
            PipelineOutcome::Dropped(reason) => {
                info!(?reason, "event dropped by policy gate");
                false
            }
            PipelineOutcome::SerializeFailed(err) => {
                warn!(error = %err, "event serialization failed");
                false
            }
        }
    }

    /// Bypasses the normal backoff/tick cadence and immediately attempts a
    /// dispatch on the transmitter. Also wakes the background dispatch
    /// scheduler, in case it is parked waiting on the next tick.
    pub async fn upload_now(&self) {
        self.transmitter.trigger_upload_now();
        self.transmitter.dispatch_once(true).await;
    }

    /// Drains the store within `maxTeardownUploadTimeInSec`, returning the
    /// number of events abandoned at the deadline, then stops the
    /// background schedulers.
    pub async fn flush_and_teardown(&self) -> usize {
        let remaining = self.transmitter.flush_and_teardown().await;
        self.dispatch_scheduler.abort();
        if let Some(handle) = &self.stats_scheduler {
            handle.abort();
        }
        remaining
    }

    pub fn register_viewer(&self, viewer: Arc<dyn Viewer>) {
        self.viewer_bus.register(viewer);
    }

    pub fn unregister_viewer(&self, name: &str) {
        self.viewer_bus.unregister(name);
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &OfflineStore {
        &self.store
    }

    pub fn transmitter(&self) -> &Transmitter {
        &self.transmitter
    }

    /// Runs one internal-diagnostics tick if `stats.interval_seconds > 0`,
    /// submitting a snapshot event back through this same logger.
    pub fn emit_stats_snapshot(&self) {
        let Some(reporter) = &self.stats else {
            return;
        };

        let snapshot = StatsSnapshot {
            drops: self.pipeline.policy_gate().counters().snapshot(),
            queue_len: self.store.len() as u64,
            disk_full_evictions: self.store.disk_full_evictions(),
            dropped_max_retries: self.store.dropped_max_retries(),
            oversize_dropped: self.transmitter.oversize_dropped_count(),
            accepted: self.transmitter.accepted_count(),
            rejected_permanent: self.transmitter.rejected_permanent_count(),
        };

        if let Some(event) = reporter.build_event(snapshot) {
            self.log_event(event);
        }
    }
}

/// Builds a fully wired [`Logger`] from `config`. Fallible only via
/// `ConfigInvalid` surfaced earlier by the builder/loader, or store I/O
/// errors opening the append log — both fatal at initialize, per the
/// propagation policy.
pub fn initialize_logger(
    config: Config,
    http: Arc<dyn HttpTransport>,
    serializer: Arc<dyn Serializer>,
) -> TelemetryResult<Arc<Logger>> {
    let store = Arc::new(OfflineStore::new(
        config.cache.clone(),
        config.transmission.max_retry_count,
    )?);
    let viewer_bus = Arc::new(ViewerBus::new());
    let clock_skew = ClockSkew::new();
    let pipeline = Pipeline::new(&config, serializer, clock_skew.clone());

    let transmitter = Arc::new(
        Transmitter::new(
            config.event_collector_uri.clone(),
            config.transmission.clone(),
            store.clone(),
            http,
            viewer_bus.clone(),
            clock_skew,
        )
        .map_err(|reason| TelemetryError::ConfigInvalid {
            field: "tpm.backoffConfig".to_string(),
            reason,
        })?,
    );

    let dispatch_scheduler = tokio::spawn(Arc::clone(&transmitter).run());

    let stats = (config.stats.interval_seconds > 0).then(|| StatsReporter::new(config.stats.clone()));
    let stats_interval_seconds = config.stats.interval_seconds;

    info!(endpoint = %config.event_collector_uri, "telemetry context initialized");

    let logger = Arc::new_cyclic(|weak: &Weak<Logger>| {
        let stats_scheduler = (stats_interval_seconds > 0).then(|| {
            let weak = weak.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(stats_interval_seconds));
                ticker.tick().await; // the first tick fires immediately; skip it
                loop {
                    ticker.tick().await;
                    let Some(logger) = weak.upgrade() else {
                        break;
                    };
                    logger.emit_stats_snapshot();
                }
            })
        });

        Logger {
            config,
            pipeline,
            store,
            transmitter,
            viewer_bus,
            stats,
            dispatch_scheduler,
            stats_scheduler,
        }
    });

    Ok(logger)
}

static SINGLETON: OnceCell<RwLock<Option<Arc<Logger>>>> = OnceCell::new();

/// Idempotent convenience initializer: the first call wins, concurrent and
/// subsequent calls receive the same [`Logger`] regardless of the `config`
/// they pass. Applications wanting multiple isolated loggers (tests, in
/// particular) should call [`initialize_logger`] directly instead.
pub async fn initialize(
    config: Config,
    http: Arc<dyn HttpTransport>,
    serializer: Arc<dyn Serializer>,
) -> TelemetryResult<Arc<Logger>> {
    let cell = SINGLETON.get_or_init(|| RwLock::new(None));

    if let Some(existing) = cell.read().await.as_ref() {
        return Ok(existing.clone());
    }

    let mut guard = cell.write().await;
    if let Some(existing) = guard.as_ref() {
        return Ok(existing.clone());
    }

    let logger = initialize_logger(config, http, serializer)?;
    *guard = Some(logger.clone());
    Ok(logger)
}

/// Clears the process-wide singleton so a fresh [`initialize`] call creates
/// a new `Logger`. Intended for tests that need a clean slate between
/// cases; production teardown should call [`Logger::flush_and_teardown`] on
/// the handle instead.
#[cfg(test)]
pub async fn reset_singleton_for_tests() {
    if let Some(cell) = SINGLETON.get() {
        *cell.write().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigBuilder;
    use crate::event::Priority;
    use crate::pipeline::serializer::CompactSerializer;
    use crate::transport::http::mock::{MockHttpTransport, ScriptedResult};
    use chrono::Utc;

    fn test_config() -> Config {
        ConfigBuilder::new()
            .event_collector_uri("https://collector.example.com")
            .primary_token("T1")
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn log_event_enqueues_and_upload_now_drains() {
        let http = Arc::new(MockHttpTransport::new(vec![ScriptedResult::Status(200)]));
        let logger = initialize_logger(test_config(), http, Arc::new(CompactSerializer)).unwrap();

        let event = Event::new("App.Started", "T1", Priority::Normal, Utc::now()).unwrap();
        assert!(logger.log_event(event));
        assert_eq!(logger.store().len(), 1);

        logger.upload_now().await;
        assert!(logger.store().is_empty());
    }

    #[tokio::test]
    async fn initialize_is_idempotent_to_concurrent_callers() {
        reset_singleton_for_tests().await;
        let http = Arc::new(MockHttpTransport::new(vec![]));
        let a = initialize(test_config(), http.clone(), Arc::new(CompactSerializer))
            .await
            .unwrap();
        let b = initialize(test_config(), http, Arc::new(CompactSerializer))
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        reset_singleton_for_tests().await;
    }

    #[tokio::test]
    async fn flush_and_teardown_reports_abandoned_count() {
        let http = Arc::new(MockHttpTransport::new(vec![]));
        let logger = initialize_logger(test_config(), http, Arc::new(CompactSerializer)).unwrap();
        let event = Event::new("App.Stuck", "T1", Priority::Normal, Utc::now()).unwrap();
        logger.log_event(event);

        let abandoned = logger.flush_and_teardown().await;
        assert_eq!(abandoned, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stats_scheduler_emits_a_snapshot_on_its_own_cadence() {
        let http = Arc::new(MockHttpTransport::new(vec![]));
        let config = ConfigBuilder::new()
            .event_collector_uri("https://collector.example.com")
            .primary_token("T1")
            .stats(crate::config::StatsConfig {
                interval_seconds: 1,
                token_int: "STATS".to_string(),
                token_prod: String::new(),
            })
            .build()
            .unwrap();
        let logger = initialize_logger(config, http, Arc::new(CompactSerializer)).unwrap();
        assert!(logger.store().is_empty());

        tokio::time::advance(Duration::from_millis(1_100)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert!(logger.store().len() >= 1);
    }
}
