//! Data Viewer Bus
//!
//! Local fanout for accepted (uploaded) payloads: anything registered as a
//! [`Viewer`] receives the exact bytes that were handed to the HTTP
//! transport, after the transport reports success. Registration is guarded
//! by a re-entrant mutex so that a viewer's `receive` callback may itself
//! register or unregister another viewer without deadlocking — the
//! dispatch loop snapshots the registered set under the lock, releases it,
//! then iterates the snapshot, so such changes take effect starting with
//! the next dispatch.

use parking_lot::ReentrantMutex;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// A sink that wants a copy of every uploaded payload.
pub trait Viewer: Send + Sync {
    fn receive(&self, bytes: &[u8]);
    fn name(&self) -> String;
}

struct Inner {
    viewers: BTreeMap<String, Arc<dyn Viewer>>,
}

/// Registry and fanout point for [`Viewer`]s.
pub struct ViewerBus {
    inner: ReentrantMutex<RefCell<Inner>>,
}

impl Default for ViewerBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ViewerBus {
    pub fn new() -> Self {
        Self {
            inner: ReentrantMutex::new(RefCell::new(Inner {
                viewers: BTreeMap::new(),
            })),
        }
    }

    /// Registers `viewer`. A second registration under the same name
    /// replaces the first.
    pub fn register(&self, viewer: Arc<dyn Viewer>) {
        let guard = self.inner.lock();
        let name = viewer.name();
        if guard.borrow_mut().viewers.insert(name.clone(), viewer).is_some() {
            debug!(viewer = %name, "viewer registration replaced an existing entry");
        }
    }

    pub fn unregister(&self, name: &str) {
        let guard = self.inner.lock();
        guard.borrow_mut().viewers.remove(name);
    }

    pub fn unregister_all(&self) {
        let guard = self.inner.lock();
        guard.borrow_mut().viewers.clear();
    }

    pub fn are_any_enabled(&self) -> bool {
        let guard = self.inner.lock();
        let any = !guard.borrow().viewers.is_empty();
        any
    }

    pub fn registered_names(&self) -> Vec<String> {
        let guard = self.inner.lock();
        let names = guard.borrow().viewers.keys().cloned().collect();
        names
    }

    /// Fans `bytes` out to every viewer registered at the moment this call
    /// snapshots the registry. A viewer whose `receive` panics is caught and
    /// logged rather than allowed to take down the other viewers or the
    /// dispatch loop.
    pub fn dispatch(&self, bytes: &[u8]) {
        let snapshot: Vec<Arc<dyn Viewer>> = {
            let guard = self.inner.lock();
            let viewers = guard.borrow().viewers.values().cloned().collect();
            viewers
        };

        for viewer in snapshot {
            let name = viewer.name();
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                viewer.receive(bytes);
            }));
            if result.is_err() {
                warn!(viewer = %name, "viewer panicked during receive");
            }
        }
    }
}
