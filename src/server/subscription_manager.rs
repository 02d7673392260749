use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::enums::BotStatus;
use crate::db::models::{BotErrorEntry, TradeHistoryEntry};

/// Clients are keyed by their authenticated user id.
pub type ClientId = i32;

/// Everything the hub relays to live clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HubEvent {
    TradeFilled(TradeHistoryEntry),
    BotError(BotErrorEntry),
    BacktestResult(serde_json::Value),
    BotStatusChanged { bot_id: i32, status: BotStatus },
    Alert { bot_id: i32, message: String },
}

/// Identifies one delivery channel of one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelHandle {
    pub client_id: ClientId,
    pub channel_id: Uuid,
}

/// Returned by [`SubscriptionManager::subscribe`]. Dropping the receiver makes
/// the channel stale; the next publish to the client prunes it.
#[derive(Debug)]
pub struct Subscription {
    pub handle: ChannelHandle,
    pub receiver: mpsc::Receiver<Arc<HubEvent>>,
}

#[derive(Debug)]
struct ChannelSlot {
    channel_id: Uuid,
    sender: mpsc::Sender<Arc<HubEvent>>,
}

/// Per-process registry of live client channels.
///
/// A client may hold several channels at once (one per open tab). Membership
/// changes and deliveries for a client all happen under that client's map
/// entry, so a publish never observes a half-updated channel set and events
/// reach each channel in the order `publish` was called.
#[derive(Debug)]
pub struct SubscriptionManager {
    clients: DashMap<ClientId, Vec<ChannelSlot>>,
    buffer: usize,
}

impl SubscriptionManager {
    pub fn new(buffer: usize) -> Self {
        Self {
            clients: DashMap::new(),
            buffer: buffer.max(1),
        }
    }

    pub fn subscribe(&self, client_id: ClientId) -> Subscription {
        let (sender, receiver) = mpsc::channel(self.buffer);
        let channel_id = Uuid::new_v4();
        let mut slots = self.clients.entry(client_id).or_default();
        slots.push(ChannelSlot { channel_id, sender });
        info!(client_id, %channel_id, channels = slots.len(), "Client channel subscribed.");
        Subscription {
            handle: ChannelHandle { client_id, channel_id },
            receiver,
        }
    }

    /// Removes one channel. Returns whether it was still registered.
    pub fn unsubscribe(&self, handle: &ChannelHandle) -> bool {
        let removed = match self.clients.get_mut(&handle.client_id) {
            Some(mut slots) => {
                let before = slots.len();
                slots.retain(|slot| slot.channel_id != handle.channel_id);
                before != slots.len()
            }
            None => false,
        };
        self.clients.remove_if(&handle.client_id, |_, slots| slots.is_empty());
        if removed {
            info!(client_id = handle.client_id, channel_id = %handle.channel_id, "Client channel unsubscribed.");
        }
        removed
    }

    /// Delivers `event` to every live channel of `client_id` and returns how
    /// many channels received it. Channels that cannot take the event are
    /// dropped from the registry; other channels are unaffected.
    pub fn publish(&self, client_id: ClientId, event: HubEvent) -> usize {
        let event = Arc::new(event);
        let mut delivered = 0;
        let now_empty = match self.clients.get_mut(&client_id) {
            Some(mut slots) => {
                slots.retain(|slot| match slot.sender.try_send(event.clone()) {
                    Ok(()) => {
                        delivered += 1;
                        true
                    }
                    Err(TrySendError::Closed(_)) => {
                        debug!(client_id, channel_id = %slot.channel_id, "Pruning closed client channel.");
                        false
                    }
                    Err(TrySendError::Full(_)) => {
                        warn!(client_id, channel_id = %slot.channel_id, "Client channel is not draining. Pruning it.");
                        false
                    }
                });
                slots.is_empty()
            }
            None => return 0,
        };
        if now_empty {
            self.clients.remove_if(&client_id, |_, slots| slots.is_empty());
        }
        delivered
    }

    pub fn channel_count(&self, client_id: ClientId) -> usize {
        self.clients.get(&client_id).map(|slots| slots.len()).unwrap_or(0)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
}
