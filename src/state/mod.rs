//! Ordered log of device state changes.
//!
//! Property writes get monotonically increasing change ids. Consecutive
//! writes to the same property coalesce into one entry; the snapshot map
//! always reflects the latest value of every property, including values
//! whose log entries were compacted away by [`StateChangeQueue::clear_up_to`].

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;

/// Minimum gap between listener notifications.
pub const NOTIFY_DEBOUNCE_MS: u64 = 250;

/// One recorded change to a state property.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub id: u64,
    pub timestamp_ms: u64,
    pub property: String,
    pub value: Value,
}

struct QueueInner {
    entries: Vec<StateChange>,
    last_id: u64,
    /// Last-seen value per property, surviving compaction.
    current: HashMap<String, Value>,
}

/// The state change queue. A single listener (the uploader) observes the
/// latest change id through [`StateChangeQueue::subscribe`]; the watch
/// channel naturally coalesces bursts, and the subscriber applies the
/// [`NOTIFY_DEBOUNCE_MS`] spacing.
pub struct StateChangeQueue {
    inner: Mutex<QueueInner>,
    notify_tx: watch::Sender<u64>,
}

impl StateChangeQueue {
    pub fn new() -> Self {
        let (notify_tx, _) = watch::channel(0);
        StateChangeQueue {
            inner: Mutex::new(QueueInner {
                entries: Vec::new(),
                last_id: 0,
                current: HashMap::new(),
            }),
            notify_tx,
        }
    }

    /// Record a property change; returns the assigned change id.
    pub fn notify(&self, property: impl Into<String>, value: Value) -> u64 {
        self.notify_at(property, value, now_ms())
    }

    /// Record a property change with an explicit timestamp.
    pub fn notify_at(&self, property: impl Into<String>, value: Value, timestamp_ms: u64) -> u64 {
        let property = property.into();
        let mut inner = self.inner.lock();
        inner.last_id += 1;
        let id = inner.last_id;

        inner.current.insert(property.clone(), value.clone());

        // Coalesce a consecutive write to the same property.
        if let Some(last) = inner.entries.last_mut() {
            if last.property == property {
                last.id = id;
                last.timestamp_ms = timestamp_ms;
                last.value = value;
                drop(inner);
                let _ = self.notify_tx.send(id);
                return id;
            }
        }

        inner.entries.push(StateChange {
            id,
            timestamp_ms,
            property,
            value,
        });
        drop(inner);
        let _ = self.notify_tx.send(id);
        id
    }

    /// The id of the most recent change, 0 if none.
    pub fn last_change_id(&self) -> u64 {
        self.inner.lock().last_id
    }

    /// Current value of every property.
    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.inner.lock().current.clone()
    }

    /// Changes with id greater than `change_id`, in insertion order.
    pub fn get_since(&self, change_id: u64) -> Vec<StateChange> {
        self.inner
            .lock()
            .entries
            .iter()
            .filter(|c| c.id > change_id)
            .cloned()
            .collect()
    }

    /// Compact entries up to and including `change_id`. Snapshot values
    /// are unaffected.
    pub fn clear_up_to(&self, change_id: u64) {
        self.inner.lock().entries.retain(|c| c.id > change_id);
    }

    /// Watch the latest change id. The initial value is the id at the
    /// time of subscription.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.notify_tx.subscribe()
    }
}

impl Default for StateChangeQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
