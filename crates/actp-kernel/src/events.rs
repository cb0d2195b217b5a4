//! Event bus for transaction lifecycle notifications
//!
//! Events are informational, not authoritative. Delivery order matches
//! commit order per transaction; there is no ordering guarantee across
//! different transactions. Every subscription call returns an unsubscribe
//! handle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use tokio::sync::broadcast;
use tracing::debug;

use actp_types::{TransactionEvent, TransactionId, TxState};

type Callback = Box<dyn Fn(&TransactionEvent) + Send + Sync>;

struct CallbackEntry {
    /// Restrict delivery to one transaction, or all when `None`
    filter: Option<TransactionId>,
    callback: Callback,
}

type CallbackMap = RwLock<HashMap<u64, CallbackEntry>>;

/// Publish-subscribe surface for kernel events
pub struct EventBus {
    sender: broadcast::Sender<TransactionEvent>,
    callbacks: Arc<CallbackMap>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            callbacks: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Broadcast a committed event to channel subscribers and callbacks
    pub fn emit(&self, event: TransactionEvent) {
        debug!(summary = %event.summary(), "event committed");

        // Ignore send errors (no receivers)
        let _ = self.sender.send(event.clone());

        let callbacks = self.callbacks.read().unwrap_or_else(|e| e.into_inner());
        for entry in callbacks.values() {
            match &entry.filter {
                Some(tx_id) if tx_id != event.tx_id() => {}
                _ => (entry.callback)(&event),
            }
        }
    }

    /// Raw broadcast receiver over all events
    pub fn subscribe(&self) -> broadcast::Receiver<TransactionEvent> {
        self.sender.subscribe()
    }

    /// Invoke `callback(tx_id, old_state, new_state)` on every committed
    /// state transition, until the returned handle is unsubscribed.
    pub fn on_state_changed<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&TransactionId, TxState, TxState) + Send + Sync + 'static,
    {
        self.register(None, Box::new(move |event| {
            if let TransactionEvent::StateChanged {
                tx_id,
                old_state,
                new_state,
                ..
            } = event
            {
                callback(tx_id, *old_state, *new_state);
            }
        }))
    }

    /// Invoke `callback(new_state)` for one transaction's state changes
    pub fn watch_transaction<F>(&self, tx_id: TransactionId, callback: F) -> Subscription
    where
        F: Fn(TxState) + Send + Sync + 'static,
    {
        self.register(
            Some(tx_id),
            Box::new(move |event| {
                if let Some(state) = event.new_state() {
                    callback(state);
                }
            }),
        )
    }

    fn register(&self, filter: Option<TransactionId>, callback: Callback) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut callbacks = self.callbacks.write().unwrap_or_else(|e| e.into_inner());
        callbacks.insert(id, CallbackEntry { filter, callback });
        Subscription {
            id,
            callbacks: Arc::downgrade(&self.callbacks),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Handle returned from every subscription call
pub struct Subscription {
    id: u64,
    callbacks: Weak<CallbackMap>,
}

impl Subscription {
    /// Stop delivering events to this subscription's callback
    pub fn unsubscribe(self) {
        if let Some(callbacks) = self.callbacks.upgrade() {
            let mut callbacks = callbacks.write().unwrap_or_else(|e| e.into_inner());
            callbacks.remove(&self.id);
        }
    }
}
