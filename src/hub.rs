//! Fan-out of viewer signals.
//!
//! Each registered viewer gets its own bounded queue; the transport task
//! for that viewer drains it. A viewer that falls behind loses signals
//! instead of holding them forever. `broadcast` works on a snapshot of the
//! viewer set, so viewers may come and go while a broadcast is in flight.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, warn};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::error::TransportError;
use crate::signal::ViewerSignal;

pub type ViewerId = u64;

/// Signals a viewer may have outstanding before new ones are dropped for it.
pub const VIEWER_QUEUE_CAPACITY: usize = 64;

struct Viewer {
    tx: mpsc::Sender<ViewerSignal>,
    /// Set while sends to this viewer fail, so the failure is logged once.
    failing: AtomicBool,
}

pub struct BroadcastHub {
    next_id: AtomicU64,
    queue_capacity: usize,
    viewers: Mutex<HashMap<ViewerId, Arc<Viewer>>>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::with_queue_capacity(VIEWER_QUEUE_CAPACITY)
    }

    pub fn with_queue_capacity(queue_capacity: usize) -> Self {
        BroadcastHub {
            next_id: AtomicU64::new(0),
            queue_capacity: queue_capacity.max(1),
            viewers: Mutex::new(HashMap::new()),
        }
    }

    fn viewers(&self) -> MutexGuard<'_, HashMap<ViewerId, Arc<Viewer>>> {
        // the map stays consistent even if a holder panicked
        self.viewers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add a viewer whose transport handshake has completed. Signals for it
    /// arrive on the returned receiver.
    pub fn register(&self) -> (ViewerId, mpsc::Receiver<ViewerSignal>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let viewer = Viewer {
            tx,
            failing: AtomicBool::new(false),
        };
        self.viewers().insert(id, Arc::new(viewer));
        debug!("Viewer {} registered", id);
        (id, rx)
    }

    /// Remove a viewer. Returns false if it was already gone.
    pub fn unregister(&self, id: ViewerId) -> bool {
        let removed = self.viewers().remove(&id).is_some();
        if removed {
            debug!("Viewer {} unregistered", id);
        }
        removed
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers().len()
    }

    /// Send `signal` to every registered viewer and return how many accepted
    /// it. A viewer that is gone or whose queue is full is skipped; removing
    /// it is left to its transport's disconnect handling.
    pub fn broadcast(&self, signal: &ViewerSignal) -> usize {
        let snapshot: Vec<_> = self
            .viewers()
            .iter()
            .map(|(id, viewer)| (*id, Arc::clone(viewer)))
            .collect();

        let mut delivered = 0;
        for (id, viewer) in snapshot {
            let err = match viewer.tx.try_send(signal.clone()) {
                Ok(()) => {
                    if viewer.failing.swap(false, Ordering::Relaxed) {
                        debug!("Viewer {} is receiving again", id);
                    }
                    delivered += 1;
                    continue;
                }
                Err(TrySendError::Full(_)) => TransportError::Lagging(id),
                Err(TrySendError::Closed(_)) => TransportError::ViewerGone(id),
            };

            if viewer.failing.swap(true, Ordering::Relaxed) {
                debug!("Error broadcasting message: {}", err);
            } else {
                warn!("Error broadcasting message: {}", err);
            }
        }
        delivered
    }
}
