//! Pending-exchange table: correlation id → one-shot response slot.
//!
//! Each proxied exchange reserves a slot before its request frame is
//! written, then waits on the receiver with a timeout. The slot reaches
//! exactly one terminal state:
//!
//! - **resolved** — the agent's response was published via [`PendingTable::complete`]
//! - **timed out** — the waiter gave up; a late response is dropped
//! - **cancelled** — the session closed ([`PendingTable::close_all`]) or the
//!   waiter went away ([`PendingGuard`] drop)

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::TunnelFrame;

/// Thread-safe map of in-flight exchanges for one session.
#[derive(Default)]
pub struct PendingTable {
    slots: Mutex<HashMap<String, oneshot::Sender<TunnelFrame>>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a slot for `id` and return its receiver. Ids are unique by
    /// construction (a per-session monotonic counter); a collision replaces
    /// the stale slot, waking its waiter with the closed sentinel.
    pub fn reserve(&self, id: &str) -> oneshot::Receiver<TunnelFrame> {
        let (tx, rx) = oneshot::channel();
        let prior = self.slots.lock().expect("pending lock").insert(id.to_string(), tx);
        if prior.is_some() {
            warn!(exchange_id = %id, "correlation id collision, replacing stale slot");
        }
        rx
    }

    /// Publish a response. Non-blocking: if the waiter already timed out or
    /// was cancelled, the message is dropped with a debug log.
    pub fn complete(&self, id: &str, frame: TunnelFrame) {
        let slot = self.slots.lock().expect("pending lock").remove(id);
        match slot {
            Some(tx) => {
                if tx.send(frame).is_err() {
                    debug!(exchange_id = %id, "waiter gone, dropping late response");
                }
            }
            None => debug!(exchange_id = %id, "no pending exchange for response"),
        }
    }

    /// Remove the slot for `id`. A sender that races this never blocks; its
    /// message is dropped by [`PendingTable::complete`].
    pub fn cancel(&self, id: &str) {
        self.slots.lock().expect("pending lock").remove(id);
    }

    /// Drop every slot. Each waiter's receiver resolves with the channel's
    /// closed error, which callers surface as a dead-session failure.
    pub fn close_all(&self) {
        let drained = {
            let mut slots = self.slots.lock().expect("pending lock");
            let n = slots.len();
            slots.clear();
            n
        };
        if drained > 0 {
            debug!(count = drained, "cancelled pending exchanges on session close");
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().expect("pending lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Removes the exchange's slot when the waiter goes away, whatever the
/// reason: timeout, session teardown, or the browser dropping the request
/// mid-flight. Removing an already-completed id is a no-op, so the guard is
/// held unconditionally for the life of the wait.
pub struct PendingGuard<'a> {
    table: &'a PendingTable,
    id: &'a str,
}

impl<'a> PendingGuard<'a> {
    pub fn new(table: &'a PendingTable, id: &'a str) -> Self {
        Self { table, id }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.table.cancel(self.id);
    }
}
