//! # Host Side
//!
//! The serving half of the bridge. A host channel answers the guest's
//! handshake, runs inbound requests through a [`RequestHandler`], and emits
//! events for the pairs the guest started.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use plugwire::RemoteError;
use plugwire::code;

use crate::channel::Channel;
use crate::channel::Role;
use crate::config::ChannelConfig;
use crate::error::Result;
use crate::logging;
use crate::transport::Transport;

/// Serves everything the guest asks of the host.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Runs `method` on `object_id`.
    async fn invoke(&self, object_id: &str, method: &str, args: Vec<Value>) -> std::result::Result<Value, RemoteError>;

    /// The guest wants events for the pair. Accepts by default.
    async fn subscribe(&self, _object_id: &str, _event: &str) -> std::result::Result<(), RemoteError> {
        Ok(())
    }

    /// The guest no longer wants events for the pair. Accepts by default.
    async fn unsubscribe(&self, _object_id: &str, _event: &str) -> std::result::Result<(), RemoteError> {
        Ok(())
    }

    /// The guest asked for a different log verbosity. Only traced by
    /// default; the global subscriber is the embedder's business.
    fn set_log_level(&self, level: &str) {
        match logging::parse_level(level) {
            Some(parsed) => tracing::info!(level = %parsed, "guest requested log level"),
            None => tracing::warn!(%level, "guest requested unknown log level"),
        }
    }
}

/// One named object served by an [`ObjectTable`].
#[async_trait]
pub trait HostObject: Send + Sync + 'static {
    async fn invoke(&self, method: &str, args: Vec<Value>) -> std::result::Result<Value, RemoteError>;

    /// Whether this object can emit `event`.
    fn emits(&self, _event: &str) -> bool {
        true
    }
}

type MethodFn = dyn Fn(&str, Vec<Value>) -> std::result::Result<Value, RemoteError> + Send + Sync;

/// Adapts a closure into a [`HostObject`].
///
/// The closure receives the method name and arguments. Unless restricted
/// with [`FnObject::events`], the object accepts every event.
pub struct FnObject {
    f: Box<MethodFn>,
    events: Option<HashSet<String>>,
}

impl FnObject {
    pub fn new(f: impl Fn(&str, Vec<Value>) -> std::result::Result<Value, RemoteError> + Send + Sync + 'static) -> Self {
        Self { f: Box::new(f), events: None }
    }

    /// Restricts the events this object emits.
    pub fn events<I, S>(mut self, events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.events = Some(events.into_iter().map(Into::into).collect());
        self
    }
}

#[async_trait]
impl HostObject for FnObject {
    async fn invoke(&self, method: &str, args: Vec<Value>) -> std::result::Result<Value, RemoteError> {
        (self.f)(method, args)
    }

    fn emits(&self, event: &str) -> bool {
        self.events.as_ref().is_none_or(|events| events.contains(event))
    }
}

/// A [`RequestHandler`] dispatching to named [`HostObject`]s.
#[derive(Default)]
pub struct ObjectTable {
    objects: DashMap<String, Arc<dyn HostObject>>,
}

impl ObjectTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `object` under `object_id`, replacing any previous one.
    pub fn insert(&self, object_id: impl Into<String>, object: impl HostObject) {
        self.objects.insert(object_id.into(), Arc::new(object));
    }

    pub fn remove(&self, object_id: &str) -> bool {
        self.objects.remove(object_id).is_some()
    }

    pub fn contains(&self, object_id: &str) -> bool {
        self.objects.contains_key(object_id)
    }

    fn get(&self, object_id: &str) -> std::result::Result<Arc<dyn HostObject>, RemoteError> {
        self.objects
            .get(object_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RemoteError::unknown_object(object_id))
    }
}

#[async_trait]
impl RequestHandler for ObjectTable {
    async fn invoke(&self, object_id: &str, method: &str, args: Vec<Value>) -> std::result::Result<Value, RemoteError> {
        let object = self.get(object_id)?;
        object.invoke(method, args).await
    }

    async fn subscribe(&self, object_id: &str, event: &str) -> std::result::Result<(), RemoteError> {
        let object = self.get(object_id)?;
        if object.emits(event) {
            Ok(())
        } else {
            Err(RemoteError::with_code(
                code::SUBSCRIPTION_REJECTED,
                format!("{object_id} does not emit {event}"),
            ))
        }
    }

    async fn unsubscribe(&self, object_id: &str, _event: &str) -> std::result::Result<(), RemoteError> {
        self.get(object_id).map(|_| ())
    }
}

/// A connected host channel.
#[derive(Clone, Debug)]
pub struct HostContext {
    channel: Channel,
    guest_origin: String,
}

impl HostContext {
    /// Builds a host channel over `transport` and completes the guest's
    /// handshake.
    pub async fn serve(
        transport: impl Transport,
        config: ChannelConfig,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<Self> {
        let channel = Channel::with_handler(Role::Host, transport, config, handler);
        let guest_origin = channel.accept().await?;
        tracing::info!(guest = %guest_origin, "serving guest");
        Ok(Self { channel, guest_origin })
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn guest_origin(&self) -> &str {
        &self.guest_origin
    }

    /// Emits an event if the guest started the pair. Returns whether it was
    /// sent.
    pub fn emit(&self, object_id: &str, event: &str, payload: Value) -> Result<bool> {
        self.channel.emit(object_id, event, payload)
    }

    pub fn is_emitting(&self, object_id: &str, event: &str) -> bool {
        self.channel.is_emitting(object_id, event)
    }

    pub async fn close(&self) {
        self.channel.close().await
    }

    /// Resolves once the guest is gone or the channel was closed.
    pub async fn closed(&self) {
        self.channel.wait_closed().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn table() -> ObjectTable {
        let table = ObjectTable::new();
        table.insert(
            "auth",
            FnObject::new(|method, _| match method {
                "getAccessToken" => Ok(json!("tok-abc")),
                other => Err(RemoteError::unknown_method("auth", other)),
            })
            .events(["sessionExpired"]),
        );
        table
    }

    #[tokio::test]
    async fn test_object_table_routes_and_reports_unknowns() {
        let table = table();

        assert_eq!(table.invoke("auth", "getAccessToken", vec![]).await.unwrap(), json!("tok-abc"));

        let err = table.invoke("auth", "logout", vec![]).await.unwrap_err();
        assert!(err.has_code(code::UNKNOWN_METHOD));

        let err = table.invoke("billing", "charge", vec![]).await.unwrap_err();
        assert!(err.has_code(code::UNKNOWN_OBJECT));
    }

    #[tokio::test]
    async fn test_object_table_gates_events() {
        let table = table();

        assert!(table.subscribe("auth", "sessionExpired").await.is_ok());
        let err = table.subscribe("auth", "tokenRefreshed").await.unwrap_err();
        assert!(err.has_code(code::SUBSCRIPTION_REJECTED));
        assert!(table.subscribe("billing", "charged").await.unwrap_err().has_code(code::UNKNOWN_OBJECT));

        assert!(table.remove("auth"));
        assert!(!table.contains("auth"));
    }
}
