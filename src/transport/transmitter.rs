//! Transmitter
//!
//! Drives one endpoint's dispatch state machine:
//!
//! ```text
//! Idle --tick/onEvent--> Armed --reserve, pack--> InFlight --response--> {Idle, Backoff}
//!  ^                                                                       |
//!  `-------------------------after delay--------- Backoff <--retryable----'
//! ```
//!
//! A single [`Transmitter`] owns one endpoint. Concurrency across
//! concurrent dispatch attempts is bounded by a semaphore sized to
//! `maxPendingHTTPRequests`; teardown is bounded by `tokio::time::timeout`
//! regardless of whether the store has finished draining.

use crate::clock_skew::ClockSkew;
use crate::config::TransmissionConfig;
use crate::pipeline::packager::Packager;
use crate::store::{OfflineStore, PersistedItem, ReleaseOutcome};
use crate::transport::backoff::{BackoffPolicy, BackoffState};
use crate::transport::http::{classify_status, HttpTransport, Request, TransmitOutcome};
use crate::viewer::ViewerBus;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Coarse state of the dispatch state machine, exposed for diagnostics and
/// tests. The transmitter does not literally step through these as
/// separate async states; `dispatch_once` collapses Armed/InFlight/response
/// handling into one call, recording the resulting state for observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Idle,
    InFlight,
    Backoff,
}

#[derive(Debug, Default)]
struct Counters {
    accepted: AtomicU64,
    rejected_permanent: AtomicU64,
    rejected_retryable: AtomicU64,
    network_failures: AtomicU64,
    aborted: AtomicU64,
    oversize_dropped: AtomicU64,
}

/// What happened on one call to [`Transmitter::dispatch_once`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchResult {
    /// Nothing was reserved; the store had nothing eligible.
    Empty,
    /// A payload was sent and classified.
    Sent(TransmitOutcome),
    /// The endpoint is currently in backoff; no attempt was made.
    BackedOff,
}

/// Drives reservation, packaging, dispatch, and response classification for
/// one collector endpoint.
pub struct Transmitter {
    endpoint: String,
    config: TransmissionConfig,
    store: Arc<OfflineStore>,
    http: Arc<dyn HttpTransport>,
    viewer_bus: Arc<ViewerBus>,
    backoff: Mutex<BackoffState>,
    state: Mutex<EndpointState>,
    in_flight: Arc<Semaphore>,
    clock_skew: Arc<ClockSkew>,
    upload_now_notify: Notify,
    shutting_down: AtomicBool,
    counters: Counters,
}

impl Transmitter {
    pub fn new(
        endpoint: impl Into<String>,
        config: TransmissionConfig,
        store: Arc<OfflineStore>,
        http: Arc<dyn HttpTransport>,
        viewer_bus: Arc<ViewerBus>,
        clock_skew: Arc<ClockSkew>,
    ) -> Result<Self, String> {
        let policy = BackoffPolicy::parse(&config.backoff_config)?;
        let max_pending = config.max_pending_http_requests;
        Ok(Self {
            endpoint: endpoint.into(),
            config,
            store,
            http,
            viewer_bus,
            backoff: Mutex::new(BackoffState::new(policy)),
            state: Mutex::new(EndpointState::Idle),
            in_flight: Arc::new(Semaphore::new(max_pending)),
            clock_skew,
            upload_now_notify: Notify::new(),
            shutting_down: AtomicBool::new(false),
            counters: Counters::default(),
        })
    }

    pub fn clock_skew_offset_ms(&self) -> i64 {
        self.clock_skew.offset_ms()
    }

    /// Wakes the running [`Transmitter::run`] scheduler immediately,
    /// bypassing its normal tick cadence.
    pub fn trigger_upload_now(&self) {
        self.upload_now_notify.notify_one();
    }

    /// Background dispatch scheduler: suspends until a tick elapses, an
    /// `UploadNow` signal arrives, the store reports memory pressure, or the
    /// current backoff expires, then attempts one dispatch. Runs until
    /// aborted (teardown) or until `shutting_down` is observed between
    /// wakeups.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.tick_interval_ms.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // the first tick fires immediately; skip it

        loop {
            if self.shutting_down.load(Ordering::Relaxed) {
                break;
            }

            let backoff_deadline = self.backoff.lock().await.next_allowed_time();

            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.upload_now_notify.notified() => {}
                _ = self.store.memory_pressure.notified() => {}
                _ = sleep_until_or_pending(backoff_deadline) => {}
            }

            if self.shutting_down.load(Ordering::Relaxed) {
                break;
            }

            self.dispatch_once(false).await;
        }
    }

    pub fn accepted_count(&self) -> u64 {
        self.counters.accepted.load(Ordering::Relaxed)
    }

    pub fn rejected_permanent_count(&self) -> u64 {
        self.counters.rejected_permanent.load(Ordering::Relaxed)
    }

    pub fn oversize_dropped_count(&self) -> u64 {
        self.counters.oversize_dropped.load(Ordering::Relaxed)
    }

    /// One reserve-pack-send-classify cycle. Returns immediately with
    /// [`DispatchResult::BackedOff`] if the endpoint's backoff has not yet
    /// elapsed, unless `force` bypasses it (`UploadNow`).
    pub async fn dispatch_once(&self, force: bool) -> DispatchResult {
        let now = Instant::now();
        if !force && self.backoff.lock().await.is_backed_off(now) {
            return DispatchResult::BackedOff;
        }

        let reserved = self.store.reserve(self.config.max_blob_size, None);
        if reserved.is_empty() {
            return DispatchResult::Empty;
        }

        let Some(permit) = self.in_flight.clone().try_acquire_owned().ok() else {
            // At the concurrency cap; release immediately so the items
            // remain eligible for the next tick.
            let ids: Vec<u64> = reserved.iter().map(|item| item.id).collect();
            self.store.release(&ids, ReleaseOutcome::Aborted);
            return DispatchResult::Empty;
        };

        *self.state.lock().await = EndpointState::InFlight;
        let outcome = self.send_batch(reserved).await;
        *self.state.lock().await = if matches!(outcome, DispatchResult::Sent(TransmitOutcome::RejectedRetryable | TransmitOutcome::NetworkFailure)) {
            EndpointState::Backoff
        } else {
            EndpointState::Idle
        };
        drop(permit);
        outcome
    }

    /// Packs `reserved` into one framed payload (deferring any record that
    /// would overflow `maxBlobSize`, dropping any record that alone exceeds
    /// it), sends it, and releases the reservation per the classified
    /// outcome.
    async fn send_batch(&self, reserved: Vec<PersistedItem>) -> DispatchResult {
        let mut packager = Packager::new();
        let mut tenant_packages: HashMap<String, crate::pipeline::packager::PackageIndex> =
            HashMap::new();
        let mut included_ids = Vec::new();
        let mut deferred_ids = Vec::new();

        for item in reserved {
            if item.len() > self.config.max_blob_size {
                self.store.release(&[item.id], ReleaseOutcome::RejectedPermanent);
                self.counters.oversize_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(item_id = item.id, size = item.len(), "dropped oversize record");
                continue;
            }

            let projected = packager.size_estimate() + item.len();
            if projected > self.config.max_blob_size && !included_ids.is_empty() {
                deferred_ids.push(item.id);
                continue;
            }

            let package = *tenant_packages
                .entry(item.tenant_token.clone())
                .or_insert_with(|| packager.add_tenant_token(item.tenant_token.clone()));
            let record = crate::pipeline::serializer::SerializedRecord {
                bytes: item.bytes.clone(),
                tenant_token: item.tenant_token.clone(),
                priority: item.priority,
                original_record_size: item.len(),
            };
            packager.add_record(package, &record);
            included_ids.push(item.id);
        }

        if !deferred_ids.is_empty() {
            self.store.release(&deferred_ids, ReleaseOutcome::Aborted);
        }

        if included_ids.is_empty() {
            return DispatchResult::Empty;
        }

        if self.shutting_down.load(Ordering::Relaxed) {
            self.store.release(&included_ids, ReleaseOutcome::Aborted);
            self.counters.aborted.fetch_add(1, Ordering::Relaxed);
            return DispatchResult::Sent(TransmitOutcome::Aborted);
        }

        let payload = packager.splice();
        let request = Request {
            endpoint: self.endpoint.clone(),
            body: payload.clone(),
            headers: HashMap::new(),
        };

        let outcome = match self.http.send(request).await {
            Ok(response) => {
                self.maybe_apply_clock_skew(&response);
                classify_status(response.status)
            }
            Err(outcome) => outcome,
        };

        self.apply_outcome(outcome, &included_ids, &payload).await;
        DispatchResult::Sent(outcome)
    }

    async fn apply_outcome(&self, outcome: TransmitOutcome, ids: &[u64], payload: &[u8]) {
        match outcome {
            TransmitOutcome::Accepted => {
                self.store.release(ids, ReleaseOutcome::Accepted);
                self.counters.accepted.fetch_add(1, Ordering::Relaxed);
                self.backoff.lock().await.on_success();
                self.viewer_bus.dispatch(payload);
                debug!(endpoint = %self.endpoint, count = ids.len(), "batch accepted");
            }
            TransmitOutcome::RejectedPermanent => {
                self.store.release(ids, ReleaseOutcome::RejectedPermanent);
                self.counters.rejected_permanent.fetch_add(1, Ordering::Relaxed);
            }
            TransmitOutcome::RejectedRetryable | TransmitOutcome::NetworkFailure => {
                self.store.release(ids, ReleaseOutcome::Retryable);
                if outcome == TransmitOutcome::NetworkFailure {
                    self.counters.network_failures.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.counters.rejected_retryable.fetch_add(1, Ordering::Relaxed);
                }
                self.backoff.lock().await.on_retryable_failure(Instant::now());
                warn!(endpoint = %self.endpoint, ?outcome, "batch will be retried after backoff");
            }
            TransmitOutcome::Aborted | TransmitOutcome::LocalFailure => {
                self.store.release(ids, ReleaseOutcome::Aborted);
                self.counters.aborted.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn maybe_apply_clock_skew(&self, response: &crate::transport::http::Response) {
        if !self.config.clock_skew_enabled {
            return;
        }
        let Some(date_header) = response.server_date() else {
            return;
        };
        let Ok(server_time) = chrono::DateTime::parse_from_rfc2822(date_header) else {
            return;
        };
        let offset_ms = server_time.timestamp_millis() - chrono::Utc::now().timestamp_millis();
        self.clock_skew.set_offset_ms(offset_ms);
    }

    /// Sets the shutdown flag (the store's own `shutting_down` flag is
    /// managed by the context) and drains armed/in-flight work until the
    /// store is empty or `deadline` elapses, whichever comes first. Returns
    /// the number of events still resident in the store when the deadline
    /// was reached (0 if draining finished first).
    pub async fn flush_and_teardown(&self) -> usize {
        self.shutting_down.store(true, Ordering::Relaxed);
        self.store.set_shutting_down(true);

        let deadline = self.config.teardown_deadline();
        let drain = async {
            while !self.store.is_empty() {
                match self.dispatch_once(true).await {
                    DispatchResult::Empty => break,
                    _ => continue,
                }
            }
        };

        if tokio::time::timeout(deadline, drain).await.is_err() {
            info!(
                endpoint = %self.endpoint,
                remaining = self.store.len(),
                "teardown deadline reached with items still undelivered"
            );
        }

        self.store.len()
    }
}

/// Sleeps until `deadline` if set, or waits forever (so the enclosing
/// `select!` branch never resolves) if backoff is not currently armed.
async fn sleep_until_or_pending(deadline: Option<Instant>) {
    match deadline {
        Some(instant) => tokio::time::sleep_until(instant).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::event::Priority;
    use crate::pipeline::serializer::SerializedRecord;
    use crate::transport::http::mock::{MockHttpTransport, ScriptedResult};

    fn transmitter(http: Arc<MockHttpTransport>) -> Transmitter {
        let store = Arc::new(OfflineStore::in_memory(CacheConfig::default(), 5));
        let viewer_bus = Arc::new(ViewerBus::new());
        let config = TransmissionConfig {
            backoff_config: "E,10,1000,2,0".to_string(),
            ..TransmissionConfig::default()
        };
        Transmitter::new(
            "https://collector.example.com",
            config,
            store,
            http,
            viewer_bus,
            ClockSkew::new(),
        )
        .unwrap()
    }

    fn put_record(transmitter: &Transmitter, bytes: &[u8], tenant: &str) {
        transmitter
            .store
            .put(&SerializedRecord {
                bytes: bytes.to_vec(),
                tenant_token: tenant.to_string(),
                priority: Priority::Normal,
                original_record_size: bytes.len(),
            })
            .unwrap();
    }

    #[tokio::test]
    async fn single_accepted_event_empties_store_and_fans_out() {
        let http = Arc::new(MockHttpTransport::new(vec![ScriptedResult::Status(200)]));
        let t = transmitter(http.clone());
        put_record(&t, b"event-a", "T1");

        let result = t.dispatch_once(false).await;
        assert_eq!(result, DispatchResult::Sent(TransmitOutcome::Accepted));
        assert!(t.store.is_empty());
        assert_eq!(t.accepted_count(), 1);
        assert_eq!(http.requests_seen(), 1);
    }

    #[tokio::test]
    async fn permanent_rejection_drops_item_without_retry() {
        let http = Arc::new(MockHttpTransport::new(vec![ScriptedResult::Status(400)]));
        let t = transmitter(http);
        put_record(&t, b"event-a", "T1");

        let result = t.dispatch_once(false).await;
        assert_eq!(result, DispatchResult::Sent(TransmitOutcome::RejectedPermanent));
        assert!(t.store.is_empty());
        assert_eq!(t.rejected_permanent_count(), 1);
    }

    #[tokio::test]
    async fn retryable_failure_arms_backoff_and_keeps_item() {
        let http = Arc::new(MockHttpTransport::new(vec![ScriptedResult::Status(503)]));
        let t = transmitter(http);
        put_record(&t, b"event-a", "T1");

        let result = t.dispatch_once(false).await;
        assert_eq!(result, DispatchResult::Sent(TransmitOutcome::RejectedRetryable));
        assert_eq!(t.store.len(), 1);

        let backed_off = t.dispatch_once(false).await;
        assert_eq!(backed_off, DispatchResult::BackedOff);
    }

    #[tokio::test]
    async fn force_bypasses_backoff() {
        let http = Arc::new(MockHttpTransport::new(vec![
            ScriptedResult::Status(200),
            ScriptedResult::Status(503),
        ]));
        let t = transmitter(http);
        put_record(&t, b"event-a", "T1");

        let _ = t.dispatch_once(false).await;
        assert_eq!(t.store.len(), 1);

        let forced = t.dispatch_once(true).await;
        assert_eq!(forced, DispatchResult::Sent(TransmitOutcome::Accepted));
    }

    #[tokio::test]
    async fn oversize_record_is_dropped_and_counted() {
        let http = Arc::new(MockHttpTransport::new(vec![]));
        let store = Arc::new(OfflineStore::in_memory(CacheConfig::default(), 5));
        let viewer_bus = Arc::new(ViewerBus::new());
        let config = TransmissionConfig {
            backoff_config: "E,10,1000,2,0".to_string(),
            max_blob_size: 4,
            ..TransmissionConfig::default()
        };
        let t = Transmitter::new(
            "https://collector.example.com",
            config,
            store,
            http,
            viewer_bus,
            ClockSkew::new(),
        )
        .unwrap();
        put_record(&t, b"way-too-long-for-the-budget", "T1");

        let result = t.dispatch_once(false).await;
        assert_eq!(result, DispatchResult::Empty);
        assert_eq!(t.oversize_dropped_count(), 1);
        assert!(t.store.is_empty());
    }

    #[tokio::test]
    async fn multi_tenant_batch_frames_in_tenant_then_insertion_order() {
        let http = Arc::new(MockHttpTransport::new(vec![ScriptedResult::Status(200)]));
        let t = transmitter(http);
        put_record(&t, b"T1.e1", "T1");
        put_record(&t, b"T2.e2", "T2");
        put_record(&t, b"T1.e3", "T1");

        struct Capture(Arc<std::sync::Mutex<Vec<u8>>>);
        impl crate::viewer::Viewer for Capture {
            fn receive(&self, bytes: &[u8]) {
                *self.0.lock().unwrap() = bytes.to_vec();
            }
            fn name(&self) -> String {
                "capture".to_string()
            }
        }
        let captured = Arc::new(std::sync::Mutex::new(Vec::new()));
        t.viewer_bus.register(Arc::new(Capture(captured.clone())));

        t.dispatch_once(false).await;
        let payload = captured.lock().unwrap().clone();
        assert_eq!(payload, b"[T1.e1,T1.e3,T2.e2]");
    }

    #[tokio::test]
    async fn teardown_completes_within_deadline_even_with_slow_backend() {
        let http = Arc::new(MockHttpTransport::new(vec![]));
        let store = Arc::new(OfflineStore::in_memory(CacheConfig::default(), 5));
        let viewer_bus = Arc::new(ViewerBus::new());
        let config = TransmissionConfig {
            backoff_config: "E,10,1000,2,0".to_string(),
            max_teardown_upload_time_in_sec: 0,
            ..TransmissionConfig::default()
        };
        let t = Arc::new(
            Transmitter::new(
                "https://collector.example.com",
                config,
                store,
                http,
                viewer_bus,
                ClockSkew::new(),
            )
            .unwrap(),
        );
        put_record(&t, b"stuck", "T1");

        let started = std::time::Instant::now();
        let remaining = t.flush_and_teardown().await;
        assert!(started.elapsed() < std::time::Duration::from_secs(2));
        assert_eq!(remaining, 1);
    }

    #[tokio::test]
    async fn run_scheduler_dispatches_on_upload_now_trigger() {
        let http = Arc::new(MockHttpTransport::new(vec![ScriptedResult::Status(200)]));
        let t = Arc::new(transmitter(http.clone()));
        put_record(&t, b"event-a", "T1");
        t.trigger_upload_now();

        let handle = tokio::spawn(Arc::clone(&t).run());

        for _ in 0..100 {
            if t.store.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.abort();

        assert!(t.store.is_empty());
        assert_eq!(http.requests_seen(), 1);
    }
}
