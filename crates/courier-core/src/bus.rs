//! The message bus facade.
//!
//! [`MessageBus`] ties topics, subscriptions and the engine together:
//! publishing appends to a topic's store and signals the topic's
//! subscriptions, subscribing resolves a cursor token into per-topic
//! positions and registers the subscription on every topic it follows.

use crate::config::BusConfig;
use crate::counters::{Counter, CounterSink, Counters, NoopSink};
use crate::engine::{Engine, TopicMap};
use crate::error::BusError;
use crate::message::{Message, MessageId};
use crate::subscription::{Cursor, MessageHandler, Subscription};
use crate::topic::{validate_topic_key, Topic};
use bytes::Bytes;
use courier_protocol::{decode, CursorPosition};
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, info, trace, warn};

/// Who is subscribing and to what.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscriber {
    identity: String,
    event_keys: Vec<String>,
}

impl Subscriber {
    /// Create a subscriber following `event_keys`. Duplicate keys are dropped.
    #[must_use]
    pub fn new<I, K>(identity: impl Into<String>, event_keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let mut keys: Vec<String> = Vec::new();
        for key in event_keys {
            let key = key.into();
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        Self {
            identity: identity.into(),
            event_keys: keys,
        }
    }

    /// Subscriber identity.
    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Topic keys to follow.
    #[must_use]
    pub fn event_keys(&self) -> &[String] {
        &self.event_keys
    }
}

/// State shared by the bus and every subscription handle.
struct BusCore {
    config: BusConfig,
    topics: Arc<TopicMap>,
    counters: Counters,
    runtime: Handle,
}

impl BusCore {
    fn topic(&self, key: &str) -> Result<Arc<Topic>, BusError> {
        validate_topic_key(key).map_err(BusError::InvalidTopic)?;

        if let Some(topic) = self.topics.get(key) {
            return Ok(Arc::clone(topic.value()));
        }

        let entry = self.topics.entry(key.to_string()).or_insert_with(|| {
            debug!(topic = %key, "Creating new topic");
            self.counters.increment(Counter::TopicsCurrent);
            Arc::new(Topic::new(key, self.config.store_capacity))
        });
        Ok(Arc::clone(entry.value()))
    }

    fn existing_topic(&self, key: &str) -> Option<Arc<Topic>> {
        self.topics.get(key).map(|t| Arc::clone(t.value()))
    }
}

/// Bus statistics.
#[derive(Debug, Clone)]
pub struct BusStats {
    /// Number of known topics.
    pub topic_count: usize,
    /// Subscription registrations summed over all topics.
    pub total_subscriptions: usize,
    /// Messages appended to all topics since start.
    pub total_messages: u64,
    /// Workers currently alive.
    pub allocated_workers: usize,
    /// Workers currently delivering.
    pub busy_workers: usize,
}

/// The in-process message bus.
///
/// Must be created inside a tokio runtime; its workers and sweep timer run
/// there.
pub struct MessageBus {
    core: Arc<BusCore>,
    engine: Engine,
}

impl MessageBus {
    /// Create a bus that reports no counters.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or no tokio runtime
    /// is running.
    pub fn new(config: BusConfig) -> Result<Self, BusError> {
        Self::with_counters(config, Arc::new(NoopSink))
    }

    /// Create a bus reporting to `sink`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or no tokio runtime
    /// is running.
    pub fn with_counters(config: BusConfig, sink: Arc<dyn CounterSink>) -> Result<Self, BusError> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|e| BusError::NoRuntime(e.to_string()))?;
        info!("Creating message bus with config: {:?}", config);

        let topics: Arc<TopicMap> = Arc::new(DashMap::new());
        let counters = Counters::new(sink);
        let engine = Engine::new(
            config.engine_config(),
            Arc::clone(&topics),
            counters.clone(),
        )?;

        Ok(Self {
            core: Arc::new(BusCore {
                config,
                topics,
                counters,
                runtime,
            }),
            engine,
        })
    }

    /// Bus configuration.
    #[must_use]
    pub fn config(&self) -> &BusConfig {
        &self.core.config
    }

    /// The scheduler driving deliveries.
    #[must_use]
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    fn ensure_running(&self) -> Result<(), BusError> {
        if self.engine.is_shut_down() {
            return Err(BusError::ShutDown);
        }
        Ok(())
    }

    /// Publish a payload and return its message id.
    ///
    /// Never waits for delivery.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is invalid or the bus is shut down.
    pub fn publish(
        &self,
        source: &str,
        key: &str,
        value: impl Into<Bytes>,
    ) -> Result<MessageId, BusError> {
        self.publish_message(Message::new(source, key, value))
    }

    /// Publish a pre-built message and return its assigned id.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is invalid or the bus is shut down.
    pub fn publish_message(&self, message: Message) -> Result<MessageId, BusError> {
        self.ensure_running()?;
        let topic = self.core.topic(&message.key)?;

        let id = topic.store().add(message);
        self.core.counters.increment(Counter::MessagesPublished);

        let subscriptions = topic.subscriptions();
        trace!(
            topic = %topic.key(),
            id,
            recipients = subscriptions.len(),
            "Published message"
        );
        for subscription in subscriptions {
            if subscription.is_disposed() {
                continue;
            }
            self.engine.schedule(subscription);
        }
        Ok(id)
    }

    /// Subscribe, resuming from `cursor` when given.
    ///
    /// A cursor that cannot be decoded is logged and ignored; the
    /// subscription then starts at each topic's current position.
    /// `max_messages` defaults to the configured batch size.
    ///
    /// # Errors
    ///
    /// Returns an error if a key is invalid, the identity already follows one
    /// of the keys, or the bus is shut down.
    pub fn subscribe(
        &self,
        subscriber: &Subscriber,
        cursor: Option<&str>,
        max_messages: Option<usize>,
        handler: impl MessageHandler,
    ) -> Result<SubscriptionHandle, BusError> {
        let positions = match cursor.map(decode).transpose() {
            Ok(positions) => positions,
            Err(e) => {
                warn!(
                    subscriber = %subscriber.identity(),
                    error = %e,
                    "Ignoring malformed cursor"
                );
                None
            }
        };
        self.register(subscriber, positions, max_messages, Arc::new(handler))
    }

    /// Subscribe like [`MessageBus::subscribe`], rejecting malformed cursors.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Cursor`] for a malformed cursor, plus the errors of
    /// [`MessageBus::subscribe`].
    pub fn subscribe_strict(
        &self,
        subscriber: &Subscriber,
        cursor: Option<&str>,
        max_messages: Option<usize>,
        handler: impl MessageHandler,
    ) -> Result<SubscriptionHandle, BusError> {
        let positions = cursor.map(decode).transpose()?;
        self.register(subscriber, positions, max_messages, Arc::new(handler))
    }

    fn register(
        &self,
        subscriber: &Subscriber,
        positions: Option<Vec<CursorPosition>>,
        max_messages: Option<usize>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<SubscriptionHandle, BusError> {
        self.ensure_running()?;
        let identity = subscriber.identity();

        // Reject before creating any topic.
        for key in subscriber.event_keys() {
            validate_topic_key(key).map_err(BusError::InvalidTopic)?;
            if self
                .core
                .existing_topic(key)
                .is_some_and(|t| t.is_subscribed(identity))
            {
                return Err(BusError::AlreadySubscribed(key.clone()));
            }
        }

        let mut topics = Vec::with_capacity(subscriber.event_keys().len());
        let mut cursors = Vec::with_capacity(subscriber.event_keys().len());
        for key in subscriber.event_keys() {
            let topic = self.core.topic(key)?;
            let id = resolve_position(&topic, positions.as_deref());
            cursors.push(Cursor::new(key.as_str(), id));
            topics.push(topic);
        }

        let subscription = Arc::new(
            Subscription::new(identity, handler)
                .with_max_messages(max_messages.unwrap_or(self.core.config.max_messages))
                .with_cursor_form(self.core.config.cursor_form)
                .with_counters(self.core.counters.clone())
                .with_cursors(cursors),
        );
        self.core.counters.increment(Counter::SubscribersCurrent);

        for (n, topic) in topics.iter().enumerate() {
            if !topic.add_subscription(Arc::clone(&subscription)) {
                // Lost a race with another subscribe for the same identity.
                for added in &topics[..n] {
                    added.remove_subscription(identity);
                }
                subscription.dispose();
                return Err(BusError::AlreadySubscribed(topic.key().to_string()));
            }
            subscription.set_event_topic(topic.key(), Arc::clone(topic));
        }
        self.core.counters.increment(Counter::SubscribersTotal);

        debug!(
            subscriber = %identity,
            topics = topics.len(),
            resumed = positions.is_some(),
            "Subscribed"
        );

        // Publishes that landed before the cursors were bound did not reach
        // this subscription.
        if positions.is_some() || subscription.has_pending() {
            self.engine.schedule(Arc::clone(&subscription));
        }

        Ok(SubscriptionHandle {
            subscription,
            core: Arc::clone(&self.core),
            torn_down: AtomicBool::new(false),
        })
    }

    /// Number of known topics.
    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.core.topics.len()
    }

    /// Keys of all known topics.
    #[must_use]
    pub fn topic_keys(&self) -> Vec<String> {
        self.core.topics.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of subscriptions following `key`.
    #[must_use]
    pub fn subscriber_count(&self, key: &str) -> usize {
        self.core
            .topics
            .get(key)
            .map(|t| t.subscription_count())
            .unwrap_or(0)
    }

    /// Id of the latest message on `key`, if the topic exists.
    #[must_use]
    pub fn last_message_id(&self, key: &str) -> Option<MessageId> {
        self.core.topics.get(key).map(|t| t.store().last_id())
    }

    /// Get bus statistics.
    #[must_use]
    pub fn stats(&self) -> BusStats {
        let (total_subscriptions, total_messages) =
            self.core.topics.iter().fold((0, 0), |(subs, msgs), t| {
                (
                    subs + t.subscription_count(),
                    msgs + t.store().message_count(),
                )
            });
        BusStats {
            topic_count: self.core.topics.len(),
            total_subscriptions,
            total_messages,
            allocated_workers: self.engine.allocated_workers(),
            busy_workers: self.engine.busy_workers(),
        }
    }

    /// Stop delivering. Publishing and subscribing fail afterwards.
    pub fn shutdown(&self) {
        self.engine.shutdown();
    }
}

impl fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageBus")
            .field("config", &self.core.config)
            .field("topics", &self.core.topics.len())
            .field("shut_down", &self.engine.is_shut_down())
            .finish()
    }
}

/// Where a new subscription starts on `topic`.
///
/// Keys absent from the cursor start at the current position. A position
/// beyond the topic's last id belongs to an earlier incarnation of the store
/// and restarts from the beginning.
fn resolve_position(topic: &Topic, positions: Option<&[CursorPosition]>) -> MessageId {
    let last_id = topic.store().last_id();
    match positions.and_then(|p| p.iter().find(|c| c.key == topic.key())) {
        Some(position) if position.id > last_id => {
            debug!(
                topic = %topic.key(),
                cursor = position.id,
                last_id,
                "Cursor ahead of topic, restarting"
            );
            0
        }
        Some(position) => position.id,
        None => last_id,
    }
}

/// Owner of a live subscription.
///
/// Dropping the handle tears the subscription down and sends the terminal
/// callback in the background; [`SubscriptionHandle::dispose`] does the same
/// and waits for the callback.
pub struct SubscriptionHandle {
    subscription: Arc<Subscription>,
    core: Arc<BusCore>,
    torn_down: AtomicBool,
}

impl SubscriptionHandle {
    /// Subscriber identity.
    #[must_use]
    pub fn identity(&self) -> &str {
        self.subscription.identity()
    }

    /// Current full cursor token.
    #[must_use]
    pub fn cursor(&self) -> String {
        self.subscription.cursor()
    }

    /// Topic keys currently followed.
    #[must_use]
    pub fn event_keys(&self) -> Vec<String> {
        self.subscription.event_keys()
    }

    /// The underlying subscription.
    #[must_use]
    pub fn subscription(&self) -> &Arc<Subscription> {
        &self.subscription
    }

    /// Whether the subscription no longer delivers.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.subscription.is_disposed()
    }

    /// Follow another topic from its current position.
    ///
    /// Returns `Ok(false)` if the key is already followed.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is invalid.
    pub fn add_event(&self, key: &str) -> Result<bool, BusError> {
        let topic = self.core.topic(key)?;
        topic.add_subscription(Arc::clone(&self.subscription));
        Ok(self.subscription.add_event(key, Some(topic)))
    }

    /// Stop following a topic.
    ///
    /// Returns `false` if the key was not followed.
    pub fn remove_event(&self, key: &str) -> bool {
        if !self.subscription.remove_event(key) {
            return false;
        }
        if let Some(topic) = self.core.existing_topic(key) {
            topic.remove_subscription(self.subscription.identity());
        }
        true
    }

    /// Dispose and unregister. Returns `true` on the first call only.
    fn teardown(&self) -> bool {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return false;
        }

        self.subscription.dispose();
        let identity = self.subscription.identity();
        for key in self.subscription.event_keys() {
            if let Some(topic) = self.core.existing_topic(&key) {
                topic.remove_subscription(identity);
            }
        }
        debug!(subscriber = %identity, "Unsubscribed");
        true
    }

    /// Tear down and wait for the terminal callback.
    ///
    /// # Errors
    ///
    /// Returns the handler's error from the terminal callback.
    pub async fn dispose(self) -> Result<(), BusError> {
        if self.teardown() {
            self.subscription.deliver_terminal().await?;
        }
        Ok(())
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if !self.teardown() {
            return;
        }

        let subscription = Arc::clone(&self.subscription);
        self.core.runtime.spawn(async move {
            if let Err(e) = subscription.deliver_terminal().await {
                warn!(
                    subscriber = %subscription.identity(),
                    error = %e,
                    "Terminal callback failed"
                );
            }
        });
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("subscription", &self.subscription)
            .finish_non_exhaustive()
    }
}
