//! Topic abstraction for Courier.
//!
//! A topic is a named event stream. It owns the bounded store its messages
//! live in and tracks the subscriptions interested in it.

use crate::store::MessageStore;
use crate::subscription::Subscription;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Maximum topic key length in bytes.
pub const MAX_TOPIC_KEY_LENGTH: usize = 256;

/// Validate a topic key.
///
/// Cursor separator characters are allowed; the cursor codec escapes them.
///
/// # Errors
///
/// Returns an error message if the key is invalid.
pub fn validate_topic_key(key: &str) -> Result<(), &'static str> {
    if key.is_empty() {
        return Err("Topic key cannot be empty");
    }
    if key.len() > MAX_TOPIC_KEY_LENGTH {
        return Err("Topic key too long");
    }
    if key.chars().any(char::is_control) {
        return Err("Topic key contains control characters");
    }
    Ok(())
}

/// A topic: one message store plus its subscriptions.
pub struct Topic {
    key: String,
    store: MessageStore,
    /// Subscriptions keyed by identity. Iterated only through snapshots.
    subscriptions: RwLock<Vec<Arc<Subscription>>>,
}

impl Topic {
    /// Create a topic whose store retains `capacity` messages.
    #[must_use]
    pub fn new(key: impl Into<String>, capacity: usize) -> Self {
        Self {
            key: key.into(),
            store: MessageStore::new(capacity),
            subscriptions: RwLock::new(Vec::new()),
        }
    }

    /// Get the topic key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Get the message store.
    #[must_use]
    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    /// Get the number of subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// Check whether a subscription identity is registered.
    #[must_use]
    pub fn is_subscribed(&self, identity: &str) -> bool {
        self.subscriptions
            .read()
            .iter()
            .any(|s| s.identity() == identity)
    }

    /// Register a subscription.
    ///
    /// Returns `false` if a subscription with the same identity is already
    /// registered.
    pub fn add_subscription(&self, subscription: Arc<Subscription>) -> bool {
        let mut subs = self.subscriptions.write();
        if subs.iter().any(|s| s.identity() == subscription.identity()) {
            return false;
        }
        debug!(topic = %self.key, subscription = %subscription.identity(), "Subscription added");
        subs.push(subscription);
        true
    }

    /// Unregister a subscription by identity.
    ///
    /// Returns `true` if it was registered.
    pub fn remove_subscription(&self, identity: &str) -> bool {
        let mut subs = self.subscriptions.write();
        let before = subs.len();
        subs.retain(|s| s.identity() != identity);
        let removed = subs.len() != before;
        if removed {
            debug!(topic = %self.key, subscription = %identity, "Subscription removed");
        }
        removed
    }

    /// Snapshot of the current subscriptions.
    ///
    /// The snapshot is safe to iterate while other threads add or remove
    /// subscriptions.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<Arc<Subscription>> {
        self.subscriptions.read().clone()
    }

    /// Check if the topic has no subscriptions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscriptions.read().is_empty()
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topic")
            .field("key", &self.key)
            .field("last_id", &self.store.last_id())
            .field("subscriptions", &self.subscription_count())
            .finish()
    }
}
