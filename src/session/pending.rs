//! Reply correlation by system id.
//!
//! A sender registers its system id *before* the request goes out and then
//! waits on the returned [`ReplySlot`]. The dispatch side resolves the slot
//! when a reply with that system id arrives. A slot removes itself from the
//! map when dropped, so timed-out or abandoned waits leave nothing behind.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::oneshot;

/// Outstanding replies, keyed by system id.
pub struct PendingReplies<M> {
    slots: Mutex<HashMap<u32, oneshot::Sender<M>>>,
}

impl<M> PendingReplies<M> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Open a slot for `system`, replacing any stale slot with the same id.
    pub fn register(&self, system: u32) -> ReplySlot<'_, M> {
        let (tx, rx) = oneshot::channel();
        if self.lock().insert(system, tx).is_some() {
            tracing::warn!("Replaced stale reply slot for system {}", system);
        }
        ReplySlot {
            pending: self,
            system,
            rx,
        }
    }

    /// Hand `reply` to the waiter for `system`.
    ///
    /// Returns the reply back when nobody is waiting for it.
    pub fn resolve(&self, system: u32, reply: M) -> Option<M> {
        let Some(tx) = self.lock().remove(&system) else {
            return Some(reply);
        };
        tx.send(reply).err()
    }

    /// Release every waiter with "no reply".
    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u32, oneshot::Sender<M>>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<M> Default for PendingReplies<M> {
    fn default() -> Self {
        Self::new()
    }
}

/// A registered wait for one reply.
pub struct ReplySlot<'a, M> {
    pending: &'a PendingReplies<M>,
    system: u32,
    rx: oneshot::Receiver<M>,
}

impl<M> ReplySlot<'_, M> {
    pub fn system(&self) -> u32 {
        self.system
    }

    /// Wait up to `timeout` for the reply.
    ///
    /// `None` on timeout or when the slot was cleared.
    pub async fn wait(mut self, timeout: Duration) -> Option<M> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(reply)) => Some(reply),
            Ok(Err(_)) => None,
            Err(_) => {
                tracing::debug!("No reply for system {} within {:?}", self.system, timeout);
                None
            }
        }
    }
}

impl<M> Drop for ReplySlot<'_, M> {
    fn drop(&mut self) {
        self.rx.close();
        let mut slots = self.pending.lock();
        // Only remove our own sender; a newer slot may have reused the id.
        if slots.get(&self.system).is_some_and(|tx| tx.is_closed()) {
            slots.remove(&self.system);
        }
    }
}
