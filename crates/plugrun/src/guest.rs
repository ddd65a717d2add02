//! # Guest Bootstrap
//!
//! Builds the guest's side of the bridge: one channel, handshaken with the
//! host, plus the lookups the embedded application needs. Contexts are plain
//! values; several can live in one process.

use std::sync::Arc;

use crate::channel::Channel;
use crate::channel::Role;
use crate::config::ChannelConfig;
use crate::error::Result;
use crate::event::EventSource;
use crate::proxy::ProxyHandle;
use crate::transport::Transport;

/// How to start a guest.
#[derive(Clone, Debug, Default)]
pub struct GuestOptions {
    /// Where the guest's application was loaded from. Diagnostics only.
    pub script_uri: Option<String>,
    /// Id of the host element the guest is mounted in. Diagnostics only.
    pub container: Option<String>,
    pub config: ChannelConfig,
}

impl GuestOptions {
    pub fn new(config: ChannelConfig) -> Self {
        Self { config, ..Self::default() }
    }

    pub fn script_uri(mut self, uri: impl Into<String>) -> Self {
        self.script_uri = Some(uri.into());
        self
    }

    pub fn container(mut self, id: impl Into<String>) -> Self {
        self.container = Some(id.into());
        self
    }
}

/// A connected guest.
#[derive(Clone, Debug)]
pub struct GuestContext {
    channel: Channel,
    host_origin: String,
    script_uri: Option<String>,
    container: Option<String>,
}

impl GuestContext {
    /// Connects to the host over `transport`. Performs the handshake and
    /// nothing else.
    pub async fn create(transport: impl Transport, options: GuestOptions) -> Result<Self> {
        let GuestOptions { script_uri, container, config } = options;
        let channel = Channel::new(Role::Guest, transport, config);
        let host_origin = channel.connect().await?;

        tracing::info!(
            host = %host_origin,
            script_uri = script_uri.as_deref().unwrap_or("-"),
            container = container.as_deref().unwrap_or("-"),
            "guest connected"
        );

        Ok(Self { channel, host_origin, script_uri, container })
    }

    /// Kept for embedders that signal readiness; the handshake already did.
    pub fn ready(&self) {}

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn host_origin(&self) -> &str {
        &self.host_origin
    }

    pub fn script_uri(&self) -> Option<&str> {
        self.script_uri.as_deref()
    }

    pub fn container(&self) -> Option<&str> {
        self.container.as_deref()
    }

    pub async fn get_object(&self, object_id: &str) -> Result<Arc<ProxyHandle>> {
        self.channel.get_object(object_id).await
    }

    pub fn event_source(&self, object_id: impl Into<String>, event: impl Into<String>) -> EventSource {
        EventSource::new(self.channel.clone(), object_id, event)
    }

    /// Asks the host to change its log verbosity.
    pub fn set_log_level(&self, level: &str) -> Result<()> {
        self.channel.set_log_level(level)
    }

    pub async fn close(&self) {
        self.channel.close().await
    }
}
