//! Registry of callbacks for server-initiated notifications.

use crate::jsonrpc::JsonRpcNotification;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Callback invoked for a matching notification, on the client's read-loop task.
pub type NotificationHandler = Arc<dyn Fn(&JsonRpcNotification) + Send + Sync>;

/// Handle returned by [`NotificationRegistry::register`], used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Maps notification method names to the callbacks registered for them.
#[derive(Default)]
pub struct NotificationRegistry {
    next_id: AtomicU64,
    handlers: RwLock<HashMap<String, Vec<(SubscriptionId, NotificationHandler)>>>,
}

impl NotificationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for notifications whose method equals `method`.
    pub fn register(&self, method: impl Into<String>, handler: NotificationHandler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.entry(method.into()).or_default().push((id, handler));
        id
    }

    /// Remove a previously registered handler. Returns false if it was already gone.
    pub fn unregister(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        let mut removed = false;
        handlers.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|(entry_id, _)| *entry_id != id);
            removed |= entries.len() != before;
            !entries.is_empty()
        });
        removed
    }

    /// Invoke every handler registered for the notification's method, in
    /// registration order. Returns how many ran.
    pub fn dispatch(&self, notification: &JsonRpcNotification) -> usize {
        // Snapshot so handlers may register or unregister without deadlocking.
        let matching: Vec<NotificationHandler> = {
            let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
            match handlers.get(&notification.method) {
                Some(entries) => entries.iter().map(|(_, h)| Arc::clone(h)).collect(),
                None => Vec::new(),
            }
        };

        for handler in &matching {
            handler(notification);
        }
        matching.len()
    }
}
