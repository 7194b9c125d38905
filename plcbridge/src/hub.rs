//! Tag-keyed fan-out to connected subscribers.
//!
//! The [`Hub`] maps each tag to the subscribers that asked for it. It is
//! owned by a single task ([`HubTask`]); everything else talks to it through
//! a cloneable [`HubHandle`], so membership changes and pushes are applied
//! in the order they were issued.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use plcbridge_common::ServerMessage;

/// Connection-unique subscriber id.
pub type SubscriberId = u64;

/// Outbound side of one connection.
#[derive(Debug, Clone)]
pub struct Subscriber {
    id: SubscriberId,
    tx: mpsc::Sender<ServerMessage>,
}

impl Subscriber {
    /// Create a subscriber and the receiver its writer task drains.
    pub fn channel(id: SubscriberId, capacity: usize) -> (Self, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { id, tx }, rx)
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Send a direct reply, waiting for buffer space.
    ///
    /// Returns `false` if the connection is gone.
    pub async fn reply(&self, message: ServerMessage) -> bool {
        self.tx.send(message).await.is_ok()
    }

    fn try_deliver(&self, message: ServerMessage) -> Result<(), TrySendError<ServerMessage>> {
        self.tx.try_send(message)
    }
}

/// Outcome of one push.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushStats {
    /// Subscribers the message was queued for.
    pub delivered: usize,
    /// Subscribers removed because their queue was full or closed.
    pub evicted: usize,
}

/// Tag to subscriber-set map.
#[derive(Debug, Default)]
pub struct Hub {
    tags: HashMap<String, HashMap<SubscriberId, Subscriber>>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscriber to a tag. Returns `false` if it was already there.
    pub fn subscribe(&mut self, subscriber: Subscriber, tag: &str) -> bool {
        let members = self.tags.entry(tag.to_string()).or_default();
        if members.contains_key(&subscriber.id) {
            return false;
        }
        members.insert(subscriber.id, subscriber);
        true
    }

    /// Queue `{"tag":tag,"value":value}` for every subscriber of `tag`.
    ///
    /// A subscriber whose queue is full or closed is removed from the tag
    /// without affecting delivery to the others.
    pub fn push(&mut self, tag: &str, value: i64) -> PushStats {
        let mut stats = PushStats::default();

        let Some(members) = self.tags.get_mut(tag) else {
            return stats;
        };

        let message = ServerMessage::push(tag, value);
        members.retain(|id, subscriber| match subscriber.try_deliver(message.clone()) {
            Ok(()) => {
                stats.delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!(subscriber = id, tag, "Subscriber too slow, evicting");
                stats.evicted += 1;
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(subscriber = id, tag, "Subscriber gone, evicting");
                stats.evicted += 1;
                false
            }
        });

        stats
    }

    /// Remove a subscriber from every tag. Returns the number of tags it left.
    pub fn unsubscribe_all(&mut self, id: SubscriberId) -> usize {
        self.tags
            .values_mut()
            .filter_map(|members| members.remove(&id))
            .count()
    }

    /// Number of subscribers on a tag.
    pub fn subscriber_count(&self, tag: &str) -> usize {
        self.tags.get(tag).map_or(0, HashMap::len)
    }

    /// Number of tags ever subscribed to.
    pub fn tag_count(&self) -> usize {
        self.tags.len()
    }
}

#[derive(Debug)]
enum HubCommand {
    Subscribe { subscriber: Subscriber, tag: String },
    Push { tag: String, value: i64 },
    UnsubscribeAll { id: SubscriberId },
}

/// Cloneable front for the hub task.
///
/// Calls never block. Once the task has stopped they are dropped.
#[derive(Debug, Clone)]
pub struct HubHandle {
    tx: mpsc::UnboundedSender<HubCommand>,
}

impl HubHandle {
    pub fn subscribe(&self, subscriber: Subscriber, tag: impl Into<String>) {
        self.send(HubCommand::Subscribe {
            subscriber,
            tag: tag.into(),
        });
    }

    pub fn push(&self, tag: impl Into<String>, value: i64) {
        self.send(HubCommand::Push {
            tag: tag.into(),
            value,
        });
    }

    pub fn unsubscribe_all(&self, id: SubscriberId) {
        self.send(HubCommand::UnsubscribeAll { id });
    }

    fn send(&self, command: HubCommand) {
        if self.tx.send(command).is_err() {
            debug!("Hub stopped, dropping command");
        }
    }
}

/// The task owning the [`Hub`].
#[derive(Debug)]
pub struct HubTask {
    hub: Hub,
    rx: mpsc::UnboundedReceiver<HubCommand>,
}

impl HubTask {
    /// Create the hub task and its handle.
    pub fn channel() -> (HubHandle, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            HubHandle { tx },
            Self {
                hub: Hub::new(),
                rx,
            },
        )
    }

    /// Apply commands until every handle is dropped.
    pub async fn run(mut self) {
        while let Some(command) = self.rx.recv().await {
            self.apply(command);
        }
        debug!(tags = self.hub.tag_count(), "Hub stopped");
    }

    fn apply(&mut self, command: HubCommand) {
        match command {
            HubCommand::Subscribe { subscriber, tag } => {
                let id = subscriber.id();
                if self.hub.subscribe(subscriber, &tag) {
                    debug!(subscriber = id, tag = %tag, "Subscribed");
                }
            }
            HubCommand::Push { tag, value } => {
                let stats = self.hub.push(&tag, value);
                debug!(
                    tag = %tag,
                    value,
                    delivered = stats.delivered,
                    evicted = stats.evicted,
                    "Pushed"
                );
            }
            HubCommand::UnsubscribeAll { id } => {
                let left = self.hub.unsubscribe_all(id);
                debug!(subscriber = id, tags = left, "Unsubscribed");
            }
        }
    }
}
