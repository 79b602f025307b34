//! Offline Store
//!
//! A bounded, durable queue of serialized records awaiting transmission.
//! Items are kept in memory for reservation bookkeeping and mirrored to an
//! append-only log on disk so that rows accepted by `put` survive an
//! ungraceful process exit, per the external interface's "append-only log
//! with compaction is acceptable" allowance.
//!
//! The table is guarded by a re-entrant mutex so that `trim()` can run
//! synchronously from inside `put()` on the same thread without deadlocking.

mod persistence;

use crate::config::CacheConfig;
use crate::error::{TelemetryError, TelemetryResult};
use crate::event::Priority;
use crate::pipeline::serializer::SerializedRecord;
use crate::transport::TransmitOutcome;
use parking_lot::ReentrantMutex;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// A row in the offline store.
#[derive(Debug, Clone)]
pub struct PersistedItem {
    pub id: u64,
    pub priority: Priority,
    pub tenant_token: String,
    pub bytes: Vec<u8>,
    pub insertion_seq: u64,
    pub retry_count: u32,
    pub reserved: bool,
}

impl PersistedItem {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }
}

/// Why `trim()` was invoked, used only for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrimReason {
    DiskBudgetExceeded,
    ManualRequest,
}

#[derive(Debug, Default)]
struct Counters {
    disk_full_evictions: AtomicU64,
    dropped_max_retries: AtomicU64,
}

struct Inner {
    items: BTreeMap<u64, PersistedItem>,
    next_id: u64,
    next_seq: u64,
    disk_bytes: u64,
    memory_bytes: u64,
    shutting_down: bool,
    log: persistence::AppendLog,
}

/// Durable, size-bounded, priority-ordered queue. See module docs.
pub struct OfflineStore {
    config: CacheConfig,
    max_retry_count: u32,
    inner: ReentrantMutex<RefCell<Inner>>,
    counters: Counters,
    /// Signaled whenever memory usage crosses its full-notification
    /// threshold, so the transmitter's dispatch loop can wake and flush
    /// early instead of waiting for the next tick.
    pub memory_pressure: Arc<Notify>,
}

impl OfflineStore {
    pub fn new(config: CacheConfig, max_retry_count: u32) -> TelemetryResult<Self> {
        let log = persistence::AppendLog::open(&config.cache_file_path)?;
        let (items, disk_bytes) = log.replay();
        info!(
            recovered_items = items.len(),
            recovered_bytes = disk_bytes,
            "offline store recovered items from disk"
        );
        let next_id = items.keys().next_back().map(|id| id + 1).unwrap_or(1);
        let next_seq = items
            .values()
            .map(|item| item.insertion_seq)
            .max()
            .map(|seq| seq + 1)
            .unwrap_or(0);

        Ok(Self {
            config,
            max_retry_count,
            inner: ReentrantMutex::new(RefCell::new(Inner {
                items,
                next_id,
                next_seq,
                disk_bytes,
                memory_bytes: disk_bytes,
                shutting_down: false,
                log,
            })),
            counters: Counters::default(),
            memory_pressure: Arc::new(Notify::new()),
        })
    }

    /// In-memory store with no disk mirroring, for tests.
    #[cfg(test)]
    pub fn in_memory(config: CacheConfig, max_retry_count: u32) -> Self {
        Self {
            config,
            max_retry_count,
            inner: ReentrantMutex::new(RefCell::new(Inner {
                items: BTreeMap::new(),
                next_id: 1,
                next_seq: 0,
                disk_bytes: 0,
                memory_bytes: 0,
                shutting_down: false,
                log: persistence::AppendLog::in_memory(),
            })),
            counters: Counters::default(),
            memory_pressure: Arc::new(Notify::new()),
        }
    }

    pub fn set_shutting_down(&self, shutting_down: bool) {
        let guard = self.inner.lock();
        guard.borrow_mut().shutting_down = shutting_down;
    }

    /// Enqueues a record. Priorities `<= Normal` are rejected once the disk
    /// budget's full-notification threshold is exceeded and trimming cannot
    /// make room; priorities `>= High` evict lower-priority items instead.
    pub fn put(
        &self,
        record: &SerializedRecord,
    ) -> TelemetryResult<u64> {
        let guard = self.inner.lock();
        let mut state = guard.borrow_mut();

        if state.shutting_down && record.priority <= Priority::Normal {
            return Err(TelemetryError::StoreFull {
                priority: record.priority,
                reason: "store is draining for teardown".to_string(),
            });
        }

        let incoming_len = record.bytes.len() as u64;
        let disk_limit = self.config.cache_file_size_limit_in_bytes;
        let disk_notify = self.config.disk_full_notification_bytes();

        if state.disk_bytes + incoming_len > disk_notify {
            if record.priority <= Priority::Normal {
                return Err(TelemetryError::StoreFull {
                    priority: record.priority,
                    reason: "disk budget full-notification threshold exceeded".to_string(),
                });
            }
            self.trim_locked(&mut state, TrimReason::DiskBudgetExceeded, incoming_len, record.priority);
        }

        if state.disk_bytes + incoming_len > disk_limit {
            return Err(TelemetryError::StoreFull {
                priority: record.priority,
                reason: "hard disk budget exceeded even after trim".to_string(),
            });
        }

        let id = state.next_id;
        state.next_id += 1;
        let seq = state.next_seq;
        state.next_seq += 1;

        let item = PersistedItem {
            id,
            priority: record.priority,
            tenant_token: record.tenant_token.clone(),
            bytes: record.bytes.clone(),
            insertion_seq: seq,
            retry_count: 0,
            reserved: false,
        };

        state.log.append(&item)?;
        state.disk_bytes += incoming_len;
        state.memory_bytes += incoming_len;
        state.items.insert(id, item);

        let memory_notify = self.config.memory_full_notification_bytes();
        if state.memory_bytes >= memory_notify {
            self.memory_pressure.notify_waiters();
        }

        Ok(id)
    }

    /// Evicts lowest-priority, oldest items until under the disk
    /// full-notification threshold, making room for an incoming record of
    /// `incoming_priority` and `incoming_len` bytes. Never evicts items of
    /// priority `>= incoming_priority`.
    fn trim_locked(
        &self,
        state: &mut Inner,
        reason: TrimReason,
        incoming_len: u64,
        incoming_priority: Priority,
    ) {
        let target = self.config.disk_full_notification_bytes();
        loop {
            if state.disk_bytes + incoming_len <= target {
                break;
            }
            let victim = state
                .items
                .values()
                .filter(|item| !item.reserved && item.priority < incoming_priority)
                .min_by_key(|item| (item.priority, item.insertion_seq))
                .map(|item| item.id);

            match victim {
                Some(id) => {
                    if let Some(item) = state.items.remove(&id) {
                        state.disk_bytes = state.disk_bytes.saturating_sub(item.len() as u64);
                        state.memory_bytes = state.memory_bytes.saturating_sub(item.len() as u64);
                        let _ = state.log.remove(id);
                        self.counters.disk_full_evictions.fetch_add(1, Ordering::Relaxed);
                        warn!(evicted_id = id, ?reason, "evicted item to satisfy disk budget");
                    }
                }
                None => break,
            }
        }
    }

    pub fn trim(&self, reason: TrimReason) {
        let guard = self.inner.lock();
        let mut state = guard.borrow_mut();
        self.trim_locked(&mut state, reason, 0, Priority::Immediate);
    }

    /// Marks up to `max_count` items (none, if `None`) totaling at most
    /// `max_bytes` as reserved and returns them, highest priority first,
    /// oldest first within a priority. Does not remove them from the store.
    pub fn reserve(&self, max_bytes: usize, max_count: Option<usize>) -> Vec<PersistedItem> {
        let guard = self.inner.lock();
        let mut state = guard.borrow_mut();

        let mut candidates: Vec<u64> = state
            .items
            .values()
            .filter(|item| !item.reserved)
            .map(|item| item.id)
            .collect();
        candidates.sort_by_key(|id| {
            let item = &state.items[id];
            (std::cmp::Reverse(item.priority), item.insertion_seq)
        });

        let mut reserved = Vec::new();
        let mut total = 0usize;
        for id in candidates {
            if let Some(limit) = max_count {
                if reserved.len() >= limit {
                    break;
                }
            }
            let len = state.items[&id].len();
            if total + len > max_bytes && !reserved.is_empty() {
                break;
            }
            if let Some(item) = state.items.get_mut(&id) {
                item.reserved = true;
                reserved.push(item.clone());
                total += len;
            }
        }
        reserved
    }

    /// Resolves a reservation according to `outcome`, applying the store's
    /// release semantics for each terminal state.
    pub fn release(&self, ids: &[u64], outcome: ReleaseOutcome) {
        let guard = self.inner.lock();
        let mut state = guard.borrow_mut();

        for &id in ids {
            match outcome {
                ReleaseOutcome::Accepted | ReleaseOutcome::RejectedPermanent => {
                    if let Some(item) = state.items.remove(&id) {
                        state.disk_bytes = state.disk_bytes.saturating_sub(item.len() as u64);
                        state.memory_bytes = state.memory_bytes.saturating_sub(item.len() as u64);
                    }
                    let _ = state.log.remove(id);
                }
                ReleaseOutcome::Retryable => {
                    let max_retry_count = self.max_retry_count;
                    let mut drop_item = false;
                    if let Some(item) = state.items.get_mut(&id) {
                        item.reserved = false;
                        item.retry_count += 1;
                        if item.retry_count > max_retry_count {
                            drop_item = true;
                        }
                    }
                    if drop_item {
                        if let Some(item) = state.items.remove(&id) {
                            state.disk_bytes = state.disk_bytes.saturating_sub(item.len() as u64);
                            state.memory_bytes = state.memory_bytes.saturating_sub(item.len() as u64);
                        }
                        let _ = state.log.remove(id);
                        self.counters.dropped_max_retries.fetch_add(1, Ordering::Relaxed);
                        debug!(item_id = id, "item exceeded max retry count and was dropped");
                    }
                }
                ReleaseOutcome::Aborted => {
                    if let Some(item) = state.items.get_mut(&id) {
                        item.reserved = false;
                    }
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        let guard = self.inner.lock();
        let len = guard.borrow().items.len();
        len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn disk_full_evictions(&self) -> u64 {
        self.counters.disk_full_evictions.load(Ordering::Relaxed)
    }

    pub fn dropped_max_retries(&self) -> u64 {
        self.counters.dropped_max_retries.load(Ordering::Relaxed)
    }
}

/// Maps a [`TransmitOutcome`] onto the store's release semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Accepted,
    RejectedPermanent,
    Retryable,
    Aborted,
}

impl From<TransmitOutcome> for ReleaseOutcome {
    fn from(outcome: TransmitOutcome) -> Self {
        match outcome {
            TransmitOutcome::Accepted => ReleaseOutcome::Accepted,
            TransmitOutcome::RejectedPermanent => ReleaseOutcome::RejectedPermanent,
            TransmitOutcome::RejectedRetryable | TransmitOutcome::NetworkFailure => {
                ReleaseOutcome::Retryable
            }
            TransmitOutcome::Aborted | TransmitOutcome::LocalFailure => ReleaseOutcome::Aborted,
        }
    }
}
