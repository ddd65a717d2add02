//! # Event Subscription Registry
//!
//! Tracks who listens to which `(object_id, event)` pair and fans inbound
//! events out to them.
//!
//! ## Invariants
//!
//! - `start` goes out only when a pair gains its first subscriber and `stop`
//!   only when it loses its last one.
//! - Host confirmations arrive in the order the controls were sent, so each
//!   pair keeps a FIFO of outstanding start/stop requests. The control is
//!   handed to the outbound queue while the table lock is held, which keeps
//!   that FIFO in wire order.
//! - Tokens are never reused.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::panic::catch_unwind;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use plugwire::RemoteError;

use crate::error::ConnectionError;
use crate::error::Error;
use crate::error::Result;

/// Identifies one subscription. Returned by subscribe, required to cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(u64);

impl Token {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// An event listener. Receives the event payload.
pub type Callback = Arc<dyn Fn(&Value) + Send + Sync>;

/// Resolves once the host has answered the start/stop for a pair.
pub type Confirmation = oneshot::Receiver<Result<()>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Start,
    Stop,
}

struct PendingControl {
    op: Op,
    waiters: Vec<oneshot::Sender<Result<()>>>,
}

impl PendingControl {
    fn new(op: Op) -> (Self, Confirmation) {
        let (tx, rx) = oneshot::channel();
        (Self { op, waiters: vec![tx] }, rx)
    }

    fn settle(self, outcome: Result<()>) {
        for waiter in self.waiters {
            let _ = waiter.send(outcome.clone());
        }
    }
}

#[derive(Default)]
struct PairState {
    subscribers: Vec<(Token, Callback)>,
    /// The host acknowledged a start and has not since stopped.
    confirmed: bool,
    pending: VecDeque<PendingControl>,
}

impl PairState {
    fn is_idle(&self) -> bool {
        self.subscribers.is_empty() && self.pending.is_empty() && !self.confirmed
    }
}

type Pair = (String, String);

fn key(object_id: &str, event: &str) -> Pair {
    (object_id.to_string(), event.to_string())
}

/// Outcome of [`Registry::add`].
pub struct Subscribed {
    pub token: Token,
    /// Present while the host has not yet confirmed the pair.
    pub confirmation: Option<Confirmation>,
}

/// Outcome of [`Registry::remove`].
pub struct Unsubscribed {
    pub found: bool,
    /// Present when a `stop` went out for the pair.
    pub confirmation: Option<Confirmation>,
}

/// Subscription table for one channel.
pub struct Registry {
    pairs: Mutex<HashMap<Pair, PairState>>,
    next_token: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            pairs: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    /// Registers `callback` for the pair.
    ///
    /// `start` is called, under the table lock, when this is the pair's
    /// first subscriber; it must enqueue the `start` control without
    /// blocking. If it fails nothing is registered.
    pub fn add(
        &self,
        object_id: &str,
        event: &str,
        callback: Callback,
        start: impl FnOnce() -> Result<()>,
    ) -> Result<Subscribed> {
        let mut pairs = self.pairs.lock();
        let k = key(object_id, event);
        let first = pairs.get(&k).is_none_or(|pair| pair.subscribers.is_empty());
        if first {
            start()?;
        }
        let pair = pairs.entry(k).or_default();

        let confirmation = if first {
            let (pending, rx) = PendingControl::new(Op::Start);
            pair.pending.push_back(pending);
            Some(rx)
        } else {
            match pair.pending.back_mut() {
                Some(inflight) if inflight.op == Op::Start => {
                    let (tx, rx) = oneshot::channel();
                    inflight.waiters.push(tx);
                    Some(rx)
                }
                _ => None,
            }
        };

        let token = Token(self.next_token.fetch_add(1, Ordering::Relaxed));
        pair.subscribers.push((token, callback));
        tracing::debug!(object_id, event, %token, count = pair.subscribers.len(), "subscribed");

        Ok(Subscribed { token, confirmation })
    }

    /// Removes the subscription behind `token`.
    ///
    /// `stop` is called, under the table lock, when the pair loses its last
    /// subscriber. If it fails the local removal still stands and no
    /// confirmation is awaited.
    pub fn remove(
        &self,
        object_id: &str,
        event: &str,
        token: Token,
        stop: impl FnOnce() -> Result<()>,
    ) -> Unsubscribed {
        let mut pairs = self.pairs.lock();
        let k = key(object_id, event);
        let Some(pair) = pairs.get_mut(&k) else {
            return Unsubscribed { found: false, confirmation: None };
        };

        let before = pair.subscribers.len();
        pair.subscribers.retain(|(t, _)| *t != token);
        if pair.subscribers.len() == before {
            return Unsubscribed { found: false, confirmation: None };
        }
        tracing::debug!(object_id, event, %token, count = pair.subscribers.len(), "unsubscribed");

        let mut confirmation = None;
        if pair.subscribers.is_empty() {
            match stop() {
                Ok(()) => {
                    let (pending, rx) = PendingControl::new(Op::Stop);
                    pair.pending.push_back(pending);
                    confirmation = Some(rx);
                }
                Err(e) => tracing::debug!(object_id, event, error = %e, "stop not sent"),
            }
        }
        if pair.is_idle() {
            pairs.remove(&k);
        }

        Unsubscribed { found: true, confirmation }
    }

    /// Drops a subscription whose confirmation never arrived, without
    /// telling the host.
    pub fn retract(&self, object_id: &str, event: &str, token: Token) {
        let mut pairs = self.pairs.lock();
        let k = key(object_id, event);
        if let Some(pair) = pairs.get_mut(&k) {
            pair.subscribers.retain(|(t, _)| *t != token);
            if pair.is_idle() {
                pairs.remove(&k);
            }
        }
    }

    /// Applies the host's `ack` (`Ok`) or `reject` (`Err`) to the oldest
    /// outstanding start/stop for the pair.
    pub fn confirm(&self, object_id: &str, event: &str, outcome: std::result::Result<(), RemoteError>) {
        let mut pairs = self.pairs.lock();
        let k = key(object_id, event);
        let Some(pair) = pairs.get_mut(&k) else {
            tracing::debug!(object_id, event, "unsolicited confirmation dropped");
            return;
        };
        let Some(pending) = pair.pending.pop_front() else {
            tracing::debug!(object_id, event, "unsolicited confirmation dropped");
            return;
        };

        match (pending.op, outcome) {
            (Op::Start, Ok(())) => {
                pair.confirmed = true;
                pending.settle(Ok(()));
            }
            (Op::Start, Err(reason)) => {
                tracing::warn!(object_id, event, %reason, "host rejected subscription");
                pair.confirmed = false;
                pair.subscribers.clear();
                pending.settle(Err(Error::subscription(object_id, event, reason.message)));
            }
            (Op::Stop, Ok(())) => {
                pair.confirmed = false;
                pending.settle(Ok(()));
            }
            (Op::Stop, Err(reason)) => {
                tracing::warn!(object_id, event, %reason, "host refused to stop emitting");
                pending.settle(Err(Error::subscription(object_id, event, reason.message)));
            }
        }

        if pair.is_idle() {
            pairs.remove(&k);
        }
    }

    /// Delivers `payload` to every subscriber of the pair, in registration
    /// order. Returns how many callbacks ran to completion.
    pub fn dispatch(&self, object_id: &str, event: &str, payload: &Value) -> usize {
        let callbacks: Vec<(Token, Callback)> = {
            let pairs = self.pairs.lock();
            match pairs.get(&key(object_id, event)) {
                Some(pair) => pair.subscribers.clone(),
                None => Vec::new(),
            }
        };

        if callbacks.is_empty() {
            tracing::trace!(object_id, event, "event without subscribers dropped");
            return 0;
        }

        let mut delivered = 0;
        for (token, callback) in callbacks {
            match catch_unwind(AssertUnwindSafe(|| callback(payload))) {
                Ok(()) => delivered += 1,
                Err(_) => tracing::warn!(object_id, event, %token, "event callback panicked"),
            }
        }
        delivered
    }

    /// Forgets every host confirmation and fails outstanding start/stop
    /// requests. Local subscriptions are kept.
    pub fn mark_unconfirmed(&self, error: &ConnectionError) {
        let mut pairs = self.pairs.lock();
        for pair in pairs.values_mut() {
            pair.confirmed = false;
            for pending in pair.pending.drain(..) {
                pending.settle(Err(Error::Connection(error.clone())));
            }
        }
        pairs.retain(|_, pair| !pair.is_idle());
    }

    pub fn subscriber_count(&self, object_id: &str, event: &str) -> usize {
        self.pairs
            .lock()
            .get(&key(object_id, event))
            .map_or(0, |pair| pair.subscribers.len())
    }

    pub fn is_confirmed(&self, object_id: &str, event: &str) -> bool {
        self.pairs
            .lock()
            .get(&key(object_id, event))
            .is_some_and(|pair| pair.confirmed)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
