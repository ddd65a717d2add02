//! # Channel with Async Pump
//!
//! One duplex link between a guest and a host context. The channel owns the
//! handshake, the outbound queue, and the inbound pump that routes every
//! envelope to the correlator, the subscription registry or the request
//! handler.
//!
//! ## Tasks
//!
//! - **Pump**: the sole reader of the transport. Processes one message at a
//!   time, so start/stop confirmations leave in the order they arrived.
//!   Requests are handed to their own task so a slow handler never stalls
//!   responses.
//! - **Writer**: the sole writer of the transport, fed by an unbounded queue.
//!   It drains whatever was queued before the channel closed, then closes the
//!   transport.
//!
//! ## Lifecycle
//!
//! ```text
//! Disconnected --connect/accept--> Connecting --hello_ack--> Connected
//!                                  Connecting --timeout/reject--> Closed
//!                                  Connected --close/peer close/io error--> Closed
//! ```
//!
//! Closed is terminal: a new channel must be built to talk again.

use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use plugwire::Control;
use plugwire::Envelope;
use plugwire::Kind;
use plugwire::PROTOCOL_VERSION;
use plugwire::RemoteError;
use plugwire::code;

use crate::config::ChannelConfig;
use crate::correlator::Correlator;
use crate::error::ConnectionError;
use crate::error::Error;
use crate::error::Result;
use crate::host::RequestHandler;
use crate::proxy::ProxyHandle;
use crate::registry::Callback;
use crate::registry::Registry;
use crate::registry::Token;
use crate::transport::Transport;

/// Where a channel is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChannelState::Disconnected => "disconnected",
            ChannelState::Connecting => "connecting",
            ChannelState::Connected => "connected",
            ChannelState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Which end of the pairing this channel is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Opens the handshake and calls into the host.
    Guest,
    /// Answers the handshake and serves objects.
    Host,
}

type Handshake = oneshot::Sender<std::result::Result<String, ConnectionError>>;

struct Link {
    state: ChannelState,
    /// Encoded envelopes sent while Connecting.
    queue: VecDeque<Vec<u8>>,
    writer: Option<mpsc::UnboundedSender<Vec<u8>>>,
    handshake: Option<Handshake>,
    pump: Option<JoinHandle<()>>,
}

pub(crate) struct ChannelInner {
    role: Role,
    config: ChannelConfig,
    transport: Arc<dyn Transport>,
    link: Mutex<Link>,
    state_tx: watch::Sender<ChannelState>,
    correlator: Correlator,
    registry: Registry,
    proxies: Mutex<HashMap<String, Arc<ProxyHandle>>>,
    handler: Option<Arc<dyn RequestHandler>>,
    /// Pairs the peer asked this side to emit.
    emitting: Mutex<HashSet<(String, String)>>,
    peer_origin: Mutex<Option<String>>,
}

/// A guest-host pairing.
///
/// Cheap to clone; every clone drives the same link.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("role", &self.inner.role)
            .field("state", &self.state())
            .field("origin", &self.inner.config.origin)
            .finish()
    }
}

impl Channel {
    /// Creates a Disconnected channel over `transport`.
    pub fn new(role: Role, transport: impl Transport, config: ChannelConfig) -> Self {
        Self::build(role, Arc::new(transport), config, None)
    }

    /// Creates a Disconnected channel that serves inbound requests and
    /// start/stop controls through `handler`.
    pub fn with_handler(
        role: Role,
        transport: impl Transport,
        config: ChannelConfig,
        handler: Arc<dyn RequestHandler>,
    ) -> Self {
        Self::build(role, Arc::new(transport), config, Some(handler))
    }

    fn build(
        role: Role,
        transport: Arc<dyn Transport>,
        config: ChannelConfig,
        handler: Option<Arc<dyn RequestHandler>>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ChannelState::Disconnected);
        let inner = ChannelInner {
            role,
            config,
            transport,
            link: Mutex::new(Link {
                state: ChannelState::Disconnected,
                queue: VecDeque::new(),
                writer: None,
                handshake: None,
                pump: None,
            }),
            state_tx,
            correlator: Correlator::new(),
            registry: Registry::new(),
            proxies: Mutex::new(HashMap::new()),
            handler,
            emitting: Mutex::new(HashSet::new()),
            peer_origin: Mutex::new(None),
        };
        Self { inner: Arc::new(inner) }
    }

    /// Opens the handshake as the guest and waits for the host's answer.
    ///
    /// Returns the host's origin. Any failure leaves the channel Closed.
    pub async fn connect(&self) -> Result<String> {
        if self.inner.role != Role::Guest {
            return Err(ConnectionError::WrongRole { op: "connect", role: self.inner.role }.into());
        }
        let handshake = self.inner.begin_handshake("connect")?;

        let hello = Control::Hello {
            origin: self.inner.config.origin.clone(),
            protocol: PROTOCOL_VERSION,
        };
        if let Err(e) = self.inner.write_now(&hello.into_envelope()) {
            self.inner.shutdown(ConnectionError::ConnectionLost(e.to_string()));
            return Err(e);
        }

        self.inner.finish_handshake(handshake).await
    }

    /// Waits for the guest's hello as the host and answers it.
    ///
    /// Returns the guest's origin. Any failure leaves the channel Closed.
    pub async fn accept(&self) -> Result<String> {
        if self.inner.role != Role::Host {
            return Err(ConnectionError::WrongRole { op: "accept", role: self.inner.role }.into());
        }
        let handshake = self.inner.begin_handshake("accept")?;
        self.inner.finish_handshake(handshake).await
    }

    /// Sends one envelope, or buffers it while the handshake is in flight.
    pub fn send(&self, envelope: &Envelope) -> Result<()> {
        self.inner.send(envelope)
    }

    /// Returns the proxy for `object_id`, creating it on first use.
    ///
    /// Never contacts the peer. The same id always yields the same handle.
    pub async fn get_object(&self, object_id: &str) -> Result<Arc<ProxyHandle>> {
        self.inner.get_object(object_id)
    }

    /// Calls `method` on the peer's object and waits for the result.
    pub async fn invoke(&self, object_id: &str, method: &str, args: Vec<Value>) -> Result<Value> {
        self.inner.invoke(object_id, method, args).await
    }

    /// Registers `callback` for `event` on `object_id`.
    ///
    /// The first subscriber of a pair asks the peer to start emitting and
    /// waits for its confirmation.
    pub async fn subscribe(&self, object_id: &str, event: &str, callback: Callback) -> Result<Token> {
        self.inner.subscribe(object_id, event, callback).await
    }

    /// Cancels a subscription. Returns false if the token was unknown.
    pub async fn unsubscribe(&self, object_id: &str, event: &str, token: Token) -> Result<bool> {
        self.inner.unsubscribe(object_id, event, token).await
    }

    /// Sends an event for a pair the peer has started.
    ///
    /// Returns false, sending nothing, if the peer never asked for it.
    pub fn emit(&self, object_id: &str, event: &str, payload: Value) -> Result<bool> {
        if !self.is_emitting(object_id, event) {
            tracing::trace!(object_id, event, "event not requested by peer");
            return Ok(false);
        }
        self.inner.send(&Envelope::event(object_id, event, payload))?;
        Ok(true)
    }

    pub fn is_emitting(&self, object_id: &str, event: &str) -> bool {
        self.inner
            .emitting
            .lock()
            .contains(&(object_id.to_string(), event.to_string()))
    }

    /// Asks the peer to change its logging verbosity. Never answered.
    pub fn set_log_level(&self, level: &str) -> Result<()> {
        self.inner.send(&Control::LogLevel { level: level.to_string() }.into_envelope())
    }

    /// Closes the channel, telling the peer when the link is up.
    ///
    /// Every pending request fails with connection-lost. Idempotent.
    pub async fn close(&self) {
        let started = {
            let link = self.inner.link.lock();
            if link.state == ChannelState::Closed {
                return;
            }
            match (&link.writer, plugwire::encode(&Control::Close.into_envelope())) {
                (Some(writer), Ok(bytes)) => {
                    let _ = writer.send(bytes);
                    true
                }
                (Some(_), Err(_)) => true,
                (None, _) => false,
            }
        };

        self.inner
            .shutdown(ConnectionError::ConnectionLost("channel closed locally".into()));

        // Without a writer nobody else will close the transport.
        if !started {
            if let Err(e) = self.inner.transport.close().await {
                tracing::debug!(error = %e, "transport close failed");
            }
        }
    }

    /// Resolves once the channel is Closed.
    pub async fn wait_closed(&self) {
        let mut rx = self.inner.state_tx.subscribe();
        let _ = rx.wait_for(|state| *state == ChannelState::Closed).await;
    }

    pub fn state(&self) -> ChannelState {
        *self.inner.state_tx.borrow()
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    /// The origin the peer announced, once the handshake succeeded.
    pub fn peer_origin(&self) -> Option<String> {
        self.inner.peer_origin.lock().clone()
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.correlator.pending_count()
    }

    pub fn oldest_pending_age(&self) -> Option<Duration> {
        self.inner.correlator.oldest_pending_age()
    }

    pub fn subscriber_count(&self, object_id: &str, event: &str) -> usize {
        self.inner.registry.subscriber_count(object_id, event)
    }

    /// True once the peer acknowledged emission for the pair.
    pub fn is_confirmed(&self, object_id: &str, event: &str) -> bool {
        self.inner.registry.is_confirmed(object_id, event)
    }
}

impl ChannelInner {
    fn state(&self) -> ChannelState {
        self.link.lock().state
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state() {
            ChannelState::Disconnected => Err(ConnectionError::NotConnected.into()),
            ChannelState::Closed => Err(ConnectionError::Closed.into()),
            ChannelState::Connecting | ChannelState::Connected => Ok(()),
        }
    }

    fn begin_handshake(
        self: &Arc<Self>,
        op: &'static str,
    ) -> Result<oneshot::Receiver<std::result::Result<String, ConnectionError>>> {
        let mut link = self.link.lock();
        if link.state != ChannelState::Disconnected {
            return Err(ConnectionError::InvalidState { op, state: link.state }.into());
        }

        let (tx, rx) = oneshot::channel();
        link.state = ChannelState::Connecting;
        link.handshake = Some(tx);
        link.writer = Some(self.spawn_writer());
        link.pump = Some(self.spawn_pump());
        drop(link);

        self.state_tx.send_replace(ChannelState::Connecting);
        tracing::debug!(role = ?self.role, origin = %self.config.origin, "handshake started");
        Ok(rx)
    }

    async fn finish_handshake(
        &self,
        handshake: oneshot::Receiver<std::result::Result<String, ConnectionError>>,
    ) -> Result<String> {
        let limit = self.config.handshake_timeout;
        let outcome = match tokio::time::timeout(limit, handshake).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ConnectionError::Closed),
            Err(_) => Err(ConnectionError::HandshakeTimeout(limit)),
        };

        match outcome {
            Ok(origin) => Ok(origin),
            Err(e) => {
                tracing::warn!(role = ?self.role, error = %e, "handshake failed");
                self.shutdown(e.clone());
                Err(e.into())
            }
        }
    }

    fn spawn_writer(self: &Arc<Self>) -> mpsc::UnboundedSender<Vec<u8>> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let transport = self.transport.clone();
        let weak = Arc::downgrade(self);

        tokio::spawn(async move {
            while let Some(bytes) = rx.recv().await {
                if let Err(e) = transport.send(&bytes).await {
                    tracing::warn!(error = %e, "transport send failed");
                    if let Some(inner) = weak.upgrade() {
                        inner.shutdown(ConnectionError::ConnectionLost(e.to_string()));
                    }
                    break;
                }
            }
            if let Err(e) = transport.close().await {
                tracing::debug!(error = %e, "transport close failed");
            }
        });

        tx
    }

    fn spawn_pump(self: &Arc<Self>) -> JoinHandle<()> {
        let transport = self.transport.clone();
        let weak: Weak<ChannelInner> = Arc::downgrade(self);

        tokio::spawn(async move {
            let reason = loop {
                let frame = transport.recv().await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                match frame {
                    Ok(Some(bytes)) => inner.on_message(&bytes).await,
                    Ok(None) => break "peer closed the transport".to_string(),
                    Err(e) => {
                        tracing::warn!(error = %e, "transport receive failed");
                        break e.to_string();
                    }
                }
            };

            if let Some(inner) = weak.upgrade() {
                inner.shutdown(ConnectionError::ConnectionLost(reason));
            }
        })
    }

    /// Moves to Closed once. Fails the handshake, every pending request and
    /// every outstanding subscription confirmation.
    fn shutdown(&self, reason: ConnectionError) {
        let (handshake, pump, dropped) = {
            let mut link = self.link.lock();
            if link.state == ChannelState::Closed {
                return;
            }
            link.state = ChannelState::Closed;
            let dropped = link.queue.len();
            link.queue.clear();
            link.writer = None;
            (link.handshake.take(), link.pump.take(), dropped)
        };
        self.state_tx.send_replace(ChannelState::Closed);

        if let Some(tx) = handshake {
            let _ = tx.send(Err(reason.clone()));
        }

        let lost = match &reason {
            ConnectionError::ConnectionLost(_) => reason.clone(),
            other => ConnectionError::ConnectionLost(other.to_string()),
        };
        let failed = self.correlator.fail_all(lost.clone());
        self.registry.mark_unconfirmed(&lost);
        self.emitting.lock().clear();

        if let Some(pump) = pump {
            pump.abort();
        }

        tracing::info!(role = ?self.role, %reason, failed, dropped, "channel closed");
    }

    /// Moves Connecting to Connected and flushes the queue in order.
    fn establish(&self, peer_origin: String) {
        let (handshake, flushed) = {
            let mut guard = self.link.lock();
            let link = &mut *guard;
            if link.state != ChannelState::Connecting {
                return;
            }
            link.state = ChannelState::Connected;
            let flushed = link.queue.len();
            if let Some(writer) = &link.writer {
                for bytes in link.queue.drain(..) {
                    let _ = writer.send(bytes);
                }
            }
            (link.handshake.take(), flushed)
        };

        *self.peer_origin.lock() = Some(peer_origin.clone());
        self.state_tx.send_replace(ChannelState::Connected);
        tracing::info!(role = ?self.role, peer = %peer_origin, flushed, "channel connected");

        if let Some(tx) = handshake {
            let _ = tx.send(Ok(peer_origin));
        }
    }

    pub(crate) fn send(&self, envelope: &Envelope) -> Result<()> {
        let bytes = plugwire::encode(envelope)?;
        self.send_bytes(bytes)?;
        Ok(())
    }

    fn send_bytes(&self, bytes: Vec<u8>) -> std::result::Result<(), ConnectionError> {
        let mut link = self.link.lock();
        match link.state {
            ChannelState::Connected => match &link.writer {
                Some(writer) => writer
                    .send(bytes)
                    .map_err(|_| ConnectionError::ConnectionLost("writer stopped".into())),
                None => Err(ConnectionError::Closed),
            },
            ChannelState::Connecting => {
                if !self.config.queue_while_connecting {
                    return Err(ConnectionError::NotConnected);
                }
                if link.queue.len() >= self.config.max_queued {
                    return Err(ConnectionError::QueueFull(self.config.max_queued));
                }
                link.queue.push_back(bytes);
                Ok(())
            }
            ChannelState::Disconnected => Err(ConnectionError::NotConnected),
            ChannelState::Closed => Err(ConnectionError::Closed),
        }
    }

    /// Writes straight to the writer, bypassing the Connecting queue.
    /// Only handshake traffic goes this way.
    fn write_now(&self, envelope: &Envelope) -> Result<()> {
        let bytes = plugwire::encode(envelope)?;
        let link = self.link.lock();
        match &link.writer {
            Some(writer) => writer
                .send(bytes)
                .map_err(|_| ConnectionError::ConnectionLost("writer stopped".into()).into()),
            None => Err(ConnectionError::Closed.into()),
        }
    }

    /// Best-effort reply from the serving side.
    fn reply(&self, envelope: &Envelope) {
        if let Err(e) = self.send(envelope) {
            tracing::debug!(
                kind = %envelope.kind,
                object_id = %envelope.object_id,
                name = %envelope.name,
                error = %e,
                "reply not sent"
            );
        }
    }

    pub(crate) fn get_object(self: &Arc<Self>, object_id: &str) -> Result<Arc<ProxyHandle>> {
        if self.state() == ChannelState::Closed {
            return Err(ConnectionError::Closed.into());
        }
        let mut proxies = self.proxies.lock();
        let handle = proxies
            .entry(object_id.to_string())
            .or_insert_with(|| Arc::new(ProxyHandle::new(object_id, Arc::downgrade(self))));
        Ok(handle.clone())
    }

    pub(crate) async fn invoke(&self, object_id: &str, method: &str, args: Vec<Value>) -> Result<Value> {
        self.ensure_open()?;
        let (id, envelope, completion) = self.correlator.prepare(object_id, method, args)?;

        if let Err(e) = self.send(&envelope) {
            self.correlator.abandon(id);
            return Err(e);
        }
        tracing::debug!(id, object_id, method, "request sent");

        match completion.await {
            Ok(outcome) => outcome,
            Err(_) => Err(ConnectionError::ConnectionLost("request dropped".into()).into()),
        }
    }

    pub(crate) async fn subscribe(&self, object_id: &str, event: &str, callback: Callback) -> Result<Token> {
        self.ensure_open()?;
        let start = Control::Start.for_pair(object_id, event);
        let subscribed = self.registry.add(object_id, event, callback, || self.send(&start))?;

        if let Some(confirmation) = subscribed.confirmation {
            let outcome = confirmation
                .await
                .unwrap_or_else(|_| Err(ConnectionError::ConnectionLost("confirmation dropped".into()).into()));
            if let Err(e) = outcome {
                self.registry.retract(object_id, event, subscribed.token);
                return Err(e);
            }
        }
        Ok(subscribed.token)
    }

    pub(crate) async fn unsubscribe(&self, object_id: &str, event: &str, token: Token) -> Result<bool> {
        let stop = Control::Stop.for_pair(object_id, event);
        let removed = self.registry.remove(object_id, event, token, || self.send(&stop));

        if let Some(confirmation) = removed.confirmation {
            match confirmation.await {
                Ok(Err(e @ Error::Subscription { .. })) => return Err(e),
                Ok(Err(e)) => tracing::debug!(object_id, event, error = %e, "stop never confirmed"),
                Ok(Ok(())) | Err(_) => {}
            }
        }
        Ok(removed.found)
    }

    async fn on_message(self: &Arc<Self>, bytes: &[u8]) {
        let envelope = match plugwire::decode(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, len = bytes.len(), "dropping undecodable frame");
                return;
            }
        };

        if envelope.kind == Kind::Control {
            self.on_control(envelope).await;
            return;
        }

        if self.state() != ChannelState::Connected {
            tracing::warn!(kind = %envelope.kind, state = %self.state(), "dropping envelope outside connected state");
            return;
        }

        match envelope.kind {
            Kind::Response => {
                if !self.correlator.settle(&envelope) {
                    tracing::debug!(id = ?envelope.id, "dropping response with no pending request");
                }
            }
            Kind::Event => {
                let payload = envelope.payload.unwrap_or(Value::Null);
                self.registry.dispatch(&envelope.object_id, &envelope.name, &payload);
            }
            Kind::Request => self.on_request(envelope),
            Kind::Control => {}
        }
    }

    fn on_request(self: &Arc<Self>, request: Envelope) {
        let Some(handler) = self.handler.clone() else {
            let reply = Envelope::response(&request, Err(RemoteError::unknown_object(&request.object_id)));
            self.reply(&reply);
            return;
        };

        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let outcome = handler
                .invoke(&request.object_id, &request.name, request.args())
                .await;
            if let Err(e) = &outcome {
                tracing::debug!(object_id = %request.object_id, method = %request.name, error = %e, "request failed");
            }
            if let Some(inner) = weak.upgrade() {
                inner.reply(&Envelope::response(&request, outcome));
            }
        });
    }

    async fn on_control(self: &Arc<Self>, envelope: Envelope) {
        let body = match envelope.control_body() {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(name = %envelope.name, error = %e, "dropping malformed control message");
                return;
            }
        };

        match body {
            Control::Hello { origin, protocol } => self.on_hello(origin, protocol),
            Control::HelloAck { origin, protocol } => self.on_hello_ack(origin, protocol),
            Control::HelloReject => {
                if self.role == Role::Guest && self.state() == ChannelState::Connecting {
                    let reason = envelope
                        .error
                        .unwrap_or_else(|| RemoteError::new("handshake rejected"));
                    self.shutdown(ConnectionError::HandshakeRejected(reason));
                }
            }
            Control::Close => {
                self.shutdown(ConnectionError::ConnectionLost("peer closed the channel".into()));
            }
            other if self.state() != ChannelState::Connected => {
                tracing::warn!(op = other.tag(), "dropping control outside connected state");
            }
            Control::Start => self.on_emit_control(envelope.object_id, envelope.name, true).await,
            Control::Stop => self.on_emit_control(envelope.object_id, envelope.name, false).await,
            Control::Ack => self.registry.confirm(&envelope.object_id, &envelope.name, Ok(())),
            Control::Reject => {
                let reason = envelope
                    .error
                    .unwrap_or_else(|| RemoteError::with_code(code::SUBSCRIPTION_REJECTED, "rejected"));
                self.registry.confirm(&envelope.object_id, &envelope.name, Err(reason));
            }
            Control::LogLevel { level } => match &self.handler {
                Some(handler) => handler.set_log_level(&level),
                None => tracing::debug!(%level, "log level hint ignored"),
            },
        }
    }

    fn on_hello(&self, origin: String, protocol: u32) {
        if self.role != Role::Host || self.state() != ChannelState::Connecting {
            tracing::warn!(role = ?self.role, %origin, "unexpected hello ignored");
            return;
        }

        let refusal = if protocol != PROTOCOL_VERSION {
            Some((
                ConnectionError::ProtocolMismatch { expected: PROTOCOL_VERSION, peer: protocol },
                RemoteError::with_code(
                    code::PROTOCOL_MISMATCH,
                    format!("expected protocol {PROTOCOL_VERSION}, got {protocol}"),
                ),
            ))
        } else if !self.config.accept.allows(&origin) {
            Some((
                ConnectionError::OriginRejected(origin.clone()),
                RemoteError::with_code(code::ORIGIN_REJECTED, format!("origin {origin} is not accepted")),
            ))
        } else {
            None
        };

        if let Some((error, reason)) = refusal {
            if let Err(e) = self.write_now(&Envelope::hello_reject(reason)) {
                tracing::debug!(error = %e, "hello_reject not sent");
            }
            self.shutdown(error);
            return;
        }

        let ack = Control::HelloAck { origin: self.config.origin.clone(), protocol: PROTOCOL_VERSION };
        if let Err(e) = self.write_now(&ack.into_envelope()) {
            self.shutdown(ConnectionError::ConnectionLost(e.to_string()));
            return;
        }
        self.establish(origin);
    }

    fn on_hello_ack(&self, origin: String, protocol: u32) {
        if self.role != Role::Guest || self.state() != ChannelState::Connecting {
            tracing::warn!(role = ?self.role, %origin, "unexpected hello_ack ignored");
            return;
        }
        if protocol != PROTOCOL_VERSION {
            self.shutdown(ConnectionError::ProtocolMismatch { expected: PROTOCOL_VERSION, peer: protocol });
            return;
        }
        if !self.config.accept.allows(&origin) {
            self.shutdown(ConnectionError::OriginRejected(origin));
            return;
        }
        self.establish(origin);
    }

    /// Serves a start/stop from the peer. Answered inline so confirmations
    /// keep the order of the requests.
    async fn on_emit_control(&self, object_id: String, event: String, start: bool) {
        let outcome = match &self.handler {
            Some(handler) if start => handler.subscribe(&object_id, &event).await,
            Some(handler) => handler.unsubscribe(&object_id, &event).await,
            None => Err(RemoteError::with_code(
                code::SUBSCRIPTION_REJECTED,
                format!("{object_id} does not emit {event}"),
            )),
        };

        match outcome {
            Ok(()) => {
                {
                    let mut emitting = self.emitting.lock();
                    if start {
                        emitting.insert((object_id.clone(), event.clone()));
                    } else {
                        emitting.remove(&(object_id.clone(), event.clone()));
                    }
                }
                tracing::debug!(%object_id, %event, start, "emission updated");
                self.reply(&Control::Ack.for_pair(object_id, event));
            }
            Err(reason) => {
                tracing::debug!(%object_id, %event, start, %reason, "emission change refused");
                self.reply(&Envelope::reject(object_id, event, reason));
            }
        }
    }
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        if let Some(pump) = self.link.get_mut().pump.take() {
            pump.abort();
        }
    }
}
