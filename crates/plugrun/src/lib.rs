//! # plugrun
//!
//! Runtime for a guest context that drives objects living in a host context,
//! with every call and event crossing a message boundary.
//!
//! ## Architecture
//!
//! - [`Transport`]: moves opaque byte messages ([`LocalTransport`] in-process,
//!   [`StreamTransport`] over any byte stream).
//! - [`Channel`]: handshake, outbound queue, and the pump routing inbound
//!   envelopes.
//! - [`correlator`]: matches responses to pending requests.
//! - [`registry`]: event subscribers and start/stop bookkeeping.
//! - [`ProxyHandle`]: local stand-in for one remote object.
//! - [`GuestContext`] / [`HostContext`]: the two ends, ready to use.

pub mod channel;
pub mod config;
pub mod correlator;
pub mod error;
pub mod event;
pub mod guest;
pub mod host;
pub mod local;
pub mod logging;
pub mod proxy;
pub mod registry;
pub mod stream;
pub mod transport;

pub use channel::Channel;
pub use channel::ChannelState;
pub use channel::Role;
pub use config::ChannelConfig;
pub use config::OriginPolicy;
pub use error::ConnectionError;
pub use error::Error;
pub use error::Result;
pub use event::EventSource;
pub use guest::GuestContext;
pub use guest::GuestOptions;
pub use host::FnObject;
pub use host::HostContext;
pub use host::HostObject;
pub use host::ObjectTable;
pub use host::RequestHandler;
pub use local::LocalTransport;
pub use proxy::ProxyHandle;
pub use registry::Callback;
pub use registry::Token;
pub use stream::StreamTransport;
pub use transport::Transport;
pub use transport::TransportError;

pub use plugwire::Envelope;
pub use plugwire::RemoteError;
