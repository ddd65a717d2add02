//! # Object Proxies
//!
//! A [`ProxyHandle`] stands for one object living in the peer context. It
//! holds nothing but the object id and a weak link back to its channel:
//! every method call becomes a request envelope and every listener a
//! subscription on that channel.
//!
//! ## Invariants
//!
//! - A channel hands out exactly one handle per object id.
//! - A handle never keeps its channel alive. Once the channel is gone every
//!   call fails with [`ConnectionError::Closed`].

use std::fmt;
use std::sync::Arc;
use std::sync::Weak;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::channel::ChannelInner;
use crate::error::ConnectionError;
use crate::error::Error;
use crate::error::Result;
use crate::registry::Token;

/// Local stand-in for a remote object.
pub struct ProxyHandle {
    id: String,
    channel: Weak<ChannelInner>,
}

impl fmt::Debug for ProxyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyHandle").field("id", &self.id).finish()
    }
}

impl ProxyHandle {
    pub(crate) fn new(id: &str, channel: Weak<ChannelInner>) -> Self {
        Self { id: id.to_string(), channel }
    }

    /// The remote object's id.
    pub fn id(&self) -> &str {
        &self.id
    }

    fn channel(&self) -> Result<Arc<ChannelInner>> {
        self.channel.upgrade().ok_or(Error::Connection(ConnectionError::Closed))
    }

    /// Calls `method` with positional `args` and waits for the result.
    pub async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        self.channel()?.invoke(&self.id, method, args).await
    }

    /// Typed wrapper over [`invoke`](Self::invoke).
    ///
    /// `args` serializes to the argument list: a tuple or array spreads into
    /// positional arguments, `()` means none, anything else is one argument.
    pub async fn call<A, R>(&self, method: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let args = match serde_json::to_value(args)? {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            single => vec![single],
        };
        let result = self.invoke(method, args).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Listens for `event` on this object.
    pub async fn add_event_listener(
        &self,
        event: &str,
        callback: impl Fn(&Value) + Send + Sync + 'static,
    ) -> Result<Token> {
        self.channel()?
            .subscribe(&self.id, event, Arc::new(callback))
            .await
    }

    /// Stops listening. Returns false if the token was unknown.
    pub async fn remove_event_listener(&self, event: &str, token: Token) -> Result<bool> {
        self.channel()?.unsubscribe(&self.id, event, token).await
    }
}
