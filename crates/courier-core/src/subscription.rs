//! Subscriptions and their delivery loop.
//!
//! A [`Subscription`] follows one subscriber across any number of topics. It
//! keeps a cursor per topic, pulls new messages from each topic's store and
//! hands them to a [`MessageHandler`] together with a fresh cursor token.
//!
//! ## States
//!
//! ```text
//!            schedule            worker picks up
//!   Idle ───────────────▶ Queued ───────────────▶ Working
//!    ▲                                              │
//!    └────────────── drained / no messages ─────────┤
//!                                                   ▼
//!                                     handler says stop ──▶ Disposed
//! ```
//!
//! `queued` keeps a subscription in the engine queue at most once and
//! `working` keeps at most one delivery loop running per subscription.

use crate::counters::{Counter, Counters};
use crate::error::BusError;
use crate::message::{Message, MessageId};
use crate::store::StoreRead;
use crate::topic::Topic;
use async_trait::async_trait;
use courier_protocol::cursor::{self, CursorWriter};
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

/// Default number of messages pulled per topic in one drain iteration.
pub const DEFAULT_MAX_MESSAGES: usize = 100;

/// Which cursor token a subscription hands to its handler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CursorForm {
    /// Every topic, including those never read (id 0).
    #[default]
    Full,
    /// Only topics whose id has advanced past 0.
    Compact,
}

/// A batch handed to a [`MessageHandler`].
#[derive(Debug, Clone, Default)]
pub struct MessageResult {
    /// Messages across all topics, in increasing id order per topic.
    pub messages: Vec<Arc<Message>>,
    /// Cursor token covering everything up to and including this batch.
    pub cursor: String,
    /// Number of messages in the batch.
    pub total_count: usize,
    /// Set on the final invocation after the subscription is disposed.
    pub terminal: bool,
}

impl MessageResult {
    /// The final result sent when a subscription is torn down.
    #[must_use]
    pub fn terminal(cursor: String) -> Self {
        Self {
            messages: Vec::new(),
            cursor,
            total_count: 0,
            terminal: true,
        }
    }

    /// Whether the batch carries no messages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Receives batches for a subscription.
///
/// Returning `Ok(true)` asks for more; `Ok(false)` ends the subscription.
/// Errors and panics are reported to the engine and do not end the
/// subscription.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Deliver one batch.
    async fn deliver(&self, result: MessageResult) -> Result<bool, BusError>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(MessageResult) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<bool, BusError>> + Send + 'static,
{
    async fn deliver(&self, result: MessageResult) -> Result<bool, BusError> {
        (self)(result).await
    }
}

/// Pulls the next batch of messages for a cursor.
///
/// The default [`StoreFetcher`] reads the topic's local store; other
/// implementations can back a subscription with a different source.
pub trait MessageFetcher: Send + Sync {
    /// Read up to `max` messages after `since_id` on `topic`.
    fn fetch(&self, topic: &Topic, since_id: MessageId, max: usize) -> StoreRead;
}

/// Fetches from the topic's own [`crate::store::MessageStore`].
#[derive(Debug, Default, Clone, Copy)]
pub struct StoreFetcher;

impl MessageFetcher for StoreFetcher {
    fn fetch(&self, topic: &Topic, since_id: MessageId, max: usize) -> StoreRead {
        topic.store().get_messages(since_id, max)
    }
}

/// Position of a subscription on one topic.
#[derive(Clone)]
pub struct Cursor {
    key: String,
    escaped_key: String,
    id: MessageId,
    topic: Option<Arc<Topic>>,
}

impl Cursor {
    /// Create a cursor that has not been bound to a topic yet.
    #[must_use]
    pub fn new(key: impl Into<String>, id: MessageId) -> Self {
        let key = key.into();
        let escaped_key = cursor::escape(&key).into_owned();
        Self {
            key,
            escaped_key,
            id,
            topic: None,
        }
    }

    /// Bind the cursor to its topic.
    #[must_use]
    pub fn with_topic(mut self, topic: Arc<Topic>) -> Self {
        self.topic = Some(topic);
        self
    }

    /// Topic key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Id of the last message seen.
    #[must_use]
    pub fn id(&self) -> MessageId {
        self.id
    }

    /// The topic this cursor reads from, once resolved.
    #[must_use]
    pub fn topic(&self) -> Option<&Arc<Topic>> {
        self.topic.as_ref()
    }
}

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("bound", &self.topic.is_some())
            .finish()
    }
}

fn write_cursors(cursors: &[Cursor], form: CursorForm) -> String {
    let mut writer = CursorWriter::with_capacity(cursors.len());
    for c in cursors {
        if form == CursorForm::Compact && c.id == 0 {
            continue;
        }
        writer.push_escaped(&c.escaped_key, c.id);
    }
    writer.finish()
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Clears the `working` flag when a delivery ends, however it ends, and
/// wakes a terminal delivery waiting for it.
struct WorkingGuard<'a> {
    working: &'a AtomicBool,
    idle: &'a Notify,
}

impl Drop for WorkingGuard<'_> {
    fn drop(&mut self) {
        self.working.store(false, Ordering::Release);
        self.idle.notify_waiters();
    }
}

/// Server-side state for one subscriber.
pub struct Subscription {
    identity: String,
    max_messages: usize,
    cursor_form: CursorForm,
    cursors: Mutex<Vec<Cursor>>,
    queued: AtomicBool,
    working: AtomicBool,
    idle: Notify,
    disposed: AtomicBool,
    handler: Arc<dyn MessageHandler>,
    fetcher: Arc<dyn MessageFetcher>,
    counters: Counters,
}

impl Subscription {
    /// Create a subscription with no topics.
    #[must_use]
    pub fn new(identity: impl Into<String>, handler: Arc<dyn MessageHandler>) -> Self {
        Self {
            identity: identity.into(),
            max_messages: DEFAULT_MAX_MESSAGES,
            cursor_form: CursorForm::default(),
            cursors: Mutex::new(Vec::new()),
            queued: AtomicBool::new(false),
            working: AtomicBool::new(false),
            idle: Notify::new(),
            disposed: AtomicBool::new(false),
            handler,
            fetcher: Arc::new(StoreFetcher),
            counters: Counters::noop(),
        }
    }

    /// Limit how many messages are pulled per topic in one iteration.
    #[must_use]
    pub fn with_max_messages(mut self, max_messages: usize) -> Self {
        self.max_messages = max_messages.max(1);
        self
    }

    /// Choose the cursor token form handed to the handler.
    #[must_use]
    pub fn with_cursor_form(mut self, form: CursorForm) -> Self {
        self.cursor_form = form;
        self
    }

    /// Replace the message source.
    #[must_use]
    pub fn with_fetcher(mut self, fetcher: Arc<dyn MessageFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    /// Report subscriber counts to `counters`.
    #[must_use]
    pub fn with_counters(mut self, counters: Counters) -> Self {
        self.counters = counters;
        self
    }

    /// Start from an initial set of cursors.
    ///
    /// Later cursors with a key already present are dropped.
    #[must_use]
    pub fn with_cursors(self, cursors: Vec<Cursor>) -> Self {
        {
            let mut own = self.cursors.lock();
            for c in cursors {
                if !own.iter().any(|existing| existing.key == c.key) {
                    own.push(c);
                }
            }
        }
        self
    }

    /// Subscriber identity.
    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Per-topic batch limit.
    #[must_use]
    pub fn max_messages(&self) -> usize {
        self.max_messages
    }

    /// Topic keys this subscription follows.
    #[must_use]
    pub fn event_keys(&self) -> Vec<String> {
        self.cursors.lock().iter().map(|c| c.key.clone()).collect()
    }

    /// Snapshot of the current cursors.
    #[must_use]
    pub fn cursors(&self) -> Vec<Cursor> {
        self.cursors.lock().clone()
    }

    /// Current full cursor token.
    #[must_use]
    pub fn cursor(&self) -> String {
        write_cursors(&self.cursors.lock(), CursorForm::Full)
    }

    /// Mark the subscription as queued.
    ///
    /// Returns `false` if it already was; the caller must not enqueue it again.
    pub fn set_queued(&self) -> bool {
        self.queued
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Clear the queued flag.
    pub fn unset_queued(&self) {
        self.queued.store(false, Ordering::Release);
    }

    /// Whether the subscription sits in the engine queue.
    #[must_use]
    pub fn is_queued(&self) -> bool {
        self.queued.load(Ordering::Acquire)
    }

    fn set_working(&self) -> bool {
        self.working
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn working_guard(&self) -> WorkingGuard<'_> {
        WorkingGuard {
            working: &self.working,
            idle: &self.idle,
        }
    }

    /// Wait until no delivery loop runs, then take the `working` flag.
    async fn acquire_working(&self) -> WorkingGuard<'_> {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.set_working() {
                return self.working_guard();
            }
            notified.await;
        }
    }

    /// Whether a delivery loop is running.
    #[must_use]
    pub fn is_working(&self) -> bool {
        self.working.load(Ordering::Acquire)
    }

    /// Whether the subscription has been disposed.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Dispose the subscription.
    ///
    /// An in-flight delivery is not interrupted; the loop stops at its next
    /// check. Returns `true` on the first call only.
    pub fn dispose(&self) -> bool {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.counters.decrement(Counter::SubscribersCurrent);
        debug!(subscription = %self.identity, "Subscription disposed");
        true
    }

    /// Follow a new topic, starting at its current position.
    ///
    /// Returns `false` if the key is already followed.
    pub fn add_event(&self, key: &str, topic: Option<Arc<Topic>>) -> bool {
        let mut cursors = self.cursors.lock();
        if cursors.iter().any(|c| c.key == key) {
            return false;
        }

        let id = topic.as_ref().map_or(0, |t| t.store().last_id());
        let mut cursor = Cursor::new(key, id);
        cursor.topic = topic;
        cursors.push(cursor);
        debug!(subscription = %self.identity, topic = %key, id, "Event added");
        true
    }

    /// Stop following a topic.
    ///
    /// Returns `false` if the key was not followed.
    pub fn remove_event(&self, key: &str) -> bool {
        let mut cursors = self.cursors.lock();
        let before = cursors.len();
        cursors.retain(|c| c.key != key);
        let removed = cursors.len() != before;
        if removed {
            debug!(subscription = %self.identity, topic = %key, "Event removed");
        }
        removed
    }

    /// Bind the cursor for `key` to `topic`.
    ///
    /// Returns `false` if the key is not followed.
    pub fn set_event_topic(&self, key: &str, topic: Arc<Topic>) -> bool {
        let mut cursors = self.cursors.lock();
        match cursors.iter_mut().find(|c| c.key == key) {
            Some(c) => {
                c.topic = Some(topic);
                true
            }
            None => false,
        }
    }

    /// Whether any bound topic's store holds messages past this cursor.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.bound_positions()
            .iter()
            .any(|(_, topic, id)| topic.store().last_id() > *id)
    }

    /// Key, topic and id of every bound cursor, copied out of the lock.
    fn bound_positions(&self) -> Vec<(String, Arc<Topic>, MessageId)> {
        self.cursors
            .lock()
            .iter()
            .filter_map(|c| Some((c.key.clone(), Arc::clone(c.topic.as_ref()?), c.id)))
            .collect()
    }

    /// Pull the next batch from every bound topic and advance the cursors.
    ///
    /// Store reads happen outside the cursor lock. A cursor that was removed
    /// or re-added while reading keeps its new state.
    fn collect(&self) -> Option<MessageResult> {
        let mut messages = Vec::new();
        let mut advanced = Vec::new();

        for (key, topic, since) in self.bound_positions() {
            let read = self.fetcher.fetch(&topic, since, self.max_messages);
            if read.is_empty() {
                continue;
            }

            let missed = read.missed(since);
            if missed > 0 {
                warn!(
                    subscription = %self.identity,
                    topic = %key,
                    since,
                    first = read.first_id,
                    missed,
                    "Cursor fell behind the retained window"
                );
            }

            advanced.push((key, since, read.last_id()));
            messages.extend(read.messages);
        }

        if messages.is_empty() {
            return None;
        }

        let mut cursors = self.cursors.lock();
        for (key, since, last_id) in advanced {
            if let Some(c) = cursors.iter_mut().find(|c| c.key == key && c.id == since) {
                c.id = last_id;
            }
        }

        Some(MessageResult {
            total_count: messages.len(),
            messages,
            cursor: write_cursors(&cursors, self.cursor_form),
            terminal: false,
        })
    }

    /// Run the delivery loop.
    ///
    /// Keeps draining while the handler asks for more and messages are
    /// available. Returns immediately if another loop is already running.
    ///
    /// # Errors
    ///
    /// Returns the handler's error, or [`BusError::HandlerPanicked`] if it
    /// panicked.
    pub async fn work(&self) -> Result<(), BusError> {
        if !self.set_working() {
            trace!(subscription = %self.identity, "Already working");
            return Ok(());
        }
        let _working = self.working_guard();

        loop {
            if self.is_disposed() {
                break;
            }

            let Some(result) = self.collect() else {
                break;
            };
            trace!(
                subscription = %self.identity,
                count = result.total_count,
                "Delivering batch"
            );

            let outcome = AssertUnwindSafe(self.handler.deliver(result))
                .catch_unwind()
                .await
                .map_err(|panic| BusError::HandlerPanicked(panic_message(&*panic)))?;

            if !outcome? {
                self.dispose();
                break;
            }
        }

        Ok(())
    }

    /// Send the final result carrying the current cursor.
    ///
    /// Waits for an in-flight delivery loop to finish first, so the terminal
    /// result is the last one the handler sees once the subscription is
    /// disposed.
    ///
    /// # Errors
    ///
    /// Returns the handler's error, or [`BusError::HandlerPanicked`].
    pub async fn deliver_terminal(&self) -> Result<(), BusError> {
        let _working = self.acquire_working().await;
        let result = MessageResult::terminal(self.cursor());
        AssertUnwindSafe(self.handler.deliver(result))
            .catch_unwind()
            .await
            .map_err(|panic| BusError::HandlerPanicked(panic_message(&*panic)))??;
        Ok(())
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("identity", &self.identity)
            .field("cursors", &*self.cursors.lock())
            .field("queued", &self.is_queued())
            .field("working", &self.is_working())
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}
