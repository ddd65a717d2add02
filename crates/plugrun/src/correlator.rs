//! # Request/Response Correlator
//!
//! Hands out request ids and matches inbound responses to the callers waiting
//! on them.
//!
//! ## Invariants
//!
//! - Ids start at 1 and are never reused for the lifetime of the correlator.
//! - Every pending request is settled at most once: removal from the table is
//!   the settlement point, so a response racing a bulk failure loses cleanly.
//! - After [`Correlator::fail_all`] no new ids are issued.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;

use plugwire::Envelope;

use crate::error::ConnectionError;
use crate::error::Error;
use crate::error::Result;

/// Resolves when the matching response arrives or the channel closes.
pub type Completion = oneshot::Receiver<Result<Value>>;

/// A call waiting for its response.
struct PendingRequest {
    object_id: String,
    method: String,
    created: Instant,
    tx: oneshot::Sender<Result<Value>>,
}

/// Pending-request table for one channel.
pub struct Correlator {
    pending: DashMap<u64, PendingRequest>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Allocates an id, registers the pending request and builds the request
    /// envelope. The caller sends the envelope and awaits the completion.
    pub fn prepare(
        &self,
        object_id: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<(u64, Envelope, Completion)> {
        if self.is_closed() {
            return Err(ConnectionError::Closed.into());
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, PendingRequest {
            object_id: object_id.to_string(),
            method: method.to_string(),
            created: Instant::now(),
            tx,
        });

        // fail_all may have drained the table between the check and the insert.
        if self.is_closed() {
            self.pending.remove(&id);
            return Err(ConnectionError::Closed.into());
        }

        Ok((id, Envelope::request(id, object_id, method, args), rx))
    }

    /// Forgets a request whose envelope never left, without settling it.
    pub fn abandon(&self, id: u64) {
        self.pending.remove(&id);
    }

    /// Settles the request a response envelope answers.
    ///
    /// Returns false when nothing was waiting: unparseable, duplicate or stale
    /// ids are dropped.
    pub fn settle(&self, response: &Envelope) -> bool {
        let Some(id) = response.id.as_deref().and_then(|id| id.parse::<u64>().ok()) else {
            return false;
        };
        let Some((_, pending)) = self.pending.remove(&id) else {
            return false;
        };

        let outcome = response
            .outcome()
            .map_err(|e| Error::from_remote(&pending.object_id, &pending.method, e));

        tracing::trace!(
            id,
            object_id = %pending.object_id,
            method = %pending.method,
            elapsed_us = pending.created.elapsed().as_micros() as u64,
            ok = outcome.is_ok(),
            "request settled"
        );

        // The caller may have stopped waiting; that is not our problem.
        let _ = pending.tx.send(outcome);
        true
    }

    /// Resolves a pending request directly.
    pub fn resolve(&self, id: u64, value: Value) -> bool {
        match self.pending.remove(&id) {
            Some((_, pending)) => {
                let _ = pending.tx.send(Ok(value));
                true
            }
            None => false,
        }
    }

    /// Rejects a pending request directly.
    pub fn reject(&self, id: u64, error: Error) -> bool {
        match self.pending.remove(&id) {
            Some((_, pending)) => {
                let _ = pending.tx.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Rejects every pending request and stops issuing ids.
    ///
    /// Returns how many requests were failed.
    pub fn fail_all(&self, error: ConnectionError) -> usize {
        self.closed.store(true, Ordering::SeqCst);

        let ids: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        let mut failed = 0;
        for id in ids {
            if let Some((_, pending)) = self.pending.remove(&id) {
                let _ = pending.tx.send(Err(Error::Connection(error.clone())));
                failed += 1;
            }
        }
        failed
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Age of the longest-waiting request, if any.
    pub fn oldest_pending_age(&self) -> Option<Duration> {
        self.pending.iter().map(|e| e.value().created.elapsed()).max()
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plugwire::RemoteError;
    use plugwire::code;
    use serde_json::json;

    fn reply(id: &str, outcome: std::result::Result<Value, RemoteError>) -> Envelope {
        let mut request = Envelope::request(0, "auth", "getAccessToken", vec![]);
        request.id = Some(id.to_string());
        Envelope::response(&request, outcome)
    }

    #[tokio::test]
    async fn test_ids_are_sequential_from_one() {
        let c = Correlator::new();
        let (a, env_a, _rx_a) = c.prepare("auth", "getAccessToken", vec![]).unwrap();
        let (b, env_b, _rx_b) = c.prepare("auth", "getAccessToken", vec![]).unwrap();

        assert_eq!((a, b), (1, 2));
        assert_eq!(env_a.id.as_deref(), Some("1"));
        assert_eq!(env_b.id.as_deref(), Some("2"));
        assert_eq!(c.pending_count(), 2);
    }

    #[tokio::test]
    async fn test_settle_delivers_to_matching_id() {
        let c = Correlator::new();
        let (_, _, rx1) = c.prepare("auth", "getAccessToken", vec![]).unwrap();
        let (_, _, rx2) = c.prepare("auth", "getAccessToken", vec![]).unwrap();

        assert!(c.settle(&reply("2", Ok(json!("second")))));
        assert!(c.settle(&reply("1", Ok(json!("first")))));

        assert_eq!(rx1.await.unwrap().unwrap(), json!("first"));
        assert_eq!(rx2.await.unwrap().unwrap(), json!("second"));
    }

    #[tokio::test]
    async fn test_duplicate_and_stale_responses_are_dropped() {
        let c = Correlator::new();
        let (_, _, rx) = c.prepare("auth", "getAccessToken", vec![]).unwrap();

        assert!(c.settle(&reply("1", Ok(json!("tok")))));
        assert!(!c.settle(&reply("1", Ok(json!("again")))));
        assert!(!c.settle(&reply("404", Ok(json!(null)))));
        assert!(!c.settle(&reply("not-a-number", Ok(json!(null)))));

        assert_eq!(rx.await.unwrap().unwrap(), json!("tok"));
    }

    #[tokio::test]
    async fn test_remote_errors_are_classified() {
        let c = Correlator::new();
        let (_, _, rx1) = c.prepare("ghost", "boo", vec![]).unwrap();
        let (_, _, rx2) = c.prepare("http", "get", vec![]).unwrap();

        c.settle(&reply("1", Err(RemoteError::unknown_object("ghost"))));
        c.settle(&reply("2", Err(RemoteError::with_code(code::INTERNAL, "502 from upstream"))));

        assert!(matches!(rx1.await.unwrap(), Err(Error::UnknownObject { object_id, .. }) if object_id == "ghost"));
        match rx2.await.unwrap() {
            Err(Error::RemoteInvocation { object_id, method, error }) => {
                assert_eq!(object_id, "http");
                assert_eq!(method, "get");
                assert_eq!(error.message, "502 from upstream");
            }
            other => panic!("expected RemoteInvocation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fail_all_settles_each_once_and_closes() {
        let c = Correlator::new();
        let receivers: Vec<_> = (0..3)
            .map(|_| c.prepare("loan", "save", vec![]).unwrap().2)
            .collect();

        let failed = c.fail_all(ConnectionError::ConnectionLost("peer went away".into()));
        assert_eq!(failed, 3);
        assert_eq!(c.pending_count(), 0);
        assert_eq!(c.fail_all(ConnectionError::Closed), 0);

        for rx in receivers {
            assert!(rx.await.unwrap().unwrap_err().is_connection_lost());
        }

        let err = c.prepare("loan", "save", vec![]).unwrap_err();
        assert!(matches!(err, Error::Connection(ConnectionError::Closed)));
    }

    #[tokio::test]
    async fn test_abandon_and_direct_settlement() {
        let c = Correlator::new();
        let (id, _, _rx) = c.prepare("session", "end", vec![]).unwrap();
        c.abandon(id);
        assert_eq!(c.pending_count(), 0);
        assert!(!c.resolve(id, json!(1)));

        let (id, _, rx) = c.prepare("session", "end", vec![]).unwrap();
        assert!(c.oldest_pending_age().is_some());
        assert!(c.reject(id, Error::Serialization("bad".into())));
        assert!(matches!(rx.await.unwrap(), Err(Error::Serialization(_))));
    }
}
