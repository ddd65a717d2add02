//! Single-event subscriptions.

use std::sync::Arc;

use serde_json::Value;

use crate::channel::Channel;
use crate::error::Result;
use crate::registry::Token;

/// One event of one remote object, bound at construction.
#[derive(Clone, Debug)]
pub struct EventSource {
    channel: Channel,
    object_id: String,
    event: String,
}

impl EventSource {
    pub fn new(channel: Channel, object_id: impl Into<String>, event: impl Into<String>) -> Self {
        Self { channel, object_id: object_id.into(), event: event.into() }
    }

    pub fn object_id(&self) -> &str {
        &self.object_id
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    pub async fn subscribe(&self, callback: impl Fn(&Value) + Send + Sync + 'static) -> Result<Token> {
        self.channel
            .subscribe(&self.object_id, &self.event, Arc::new(callback))
            .await
    }

    pub async fn unsubscribe(&self, token: Token) -> Result<bool> {
        self.channel.unsubscribe(&self.object_id, &self.event, token).await
    }

    pub fn subscriber_count(&self) -> usize {
        self.channel.subscriber_count(&self.object_id, &self.event)
    }
}
