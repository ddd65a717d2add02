//! # Channel Configuration
//!
//! Everything a channel needs to know before it talks to its peer: who it
//! claims to be, whom it accepts, and how patient it is.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Overrides `handshake_timeout` (milliseconds) in [`ChannelConfig::from_env`].
pub const HANDSHAKE_TIMEOUT_ENV: &str = "PLUGBRIDGE_HANDSHAKE_TIMEOUT_MS";
/// Overrides `max_queued` in [`ChannelConfig::from_env`].
pub const MAX_QUEUED_ENV: &str = "PLUGBRIDGE_MAX_QUEUED";

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_MAX_QUEUED: usize = 1024;
const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Decides whether the peer's announced origin is acceptable.
#[derive(Clone, Default)]
pub enum OriginPolicy {
    /// Accept every origin.
    #[default]
    Any,
    /// Accept only these exact origins.
    Exact(Vec<String>),
    /// Accept origins for which the predicate returns true.
    Predicate(Arc<dyn Fn(&str) -> bool + Send + Sync>),
}

impl OriginPolicy {
    pub fn predicate(f: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        Self::Predicate(Arc::new(f))
    }

    pub fn allows(&self, origin: &str) -> bool {
        match self {
            OriginPolicy::Any => true,
            OriginPolicy::Exact(allowed) => allowed.iter().any(|a| a == origin),
            OriginPolicy::Predicate(f) => f(origin),
        }
    }
}

impl fmt::Debug for OriginPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => write!(f, "Any"),
            Self::Exact(allowed) => f.debug_tuple("Exact").field(allowed).finish(),
            Self::Predicate(_) => write!(f, "Predicate(..)"),
        }
    }
}

/// Per-channel settings.
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    /// The identity this side announces during the handshake.
    pub origin: String,
    /// Which peer origins complete the handshake.
    pub accept: OriginPolicy,
    /// How long `connect`/`accept` wait for the other side.
    pub handshake_timeout: Duration,
    /// Buffer sends issued while Connecting instead of rejecting them.
    pub queue_while_connecting: bool,
    /// Upper bound on envelopes buffered while Connecting.
    pub max_queued: usize,
    /// Largest frame a stream transport built from this config will accept.
    pub max_frame_len: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            origin: "local".to_string(),
            accept: OriginPolicy::Any,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            queue_while_connecting: true,
            max_queued: DEFAULT_MAX_QUEUED,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl ChannelConfig {
    pub fn new(origin: impl Into<String>) -> Self {
        Self { origin: origin.into(), ..Self::default() }
    }

    /// Defaults overlaid with any `PLUGBRIDGE_*` environment overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(ms) = env_positive(HANDSHAKE_TIMEOUT_ENV) {
            config.handshake_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = env_positive(MAX_QUEUED_ENV) {
            config.max_queued = n as usize;
        }
        config
    }

    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    pub fn accept_origins<I, S>(mut self, origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.accept = OriginPolicy::Exact(origins.into_iter().map(Into::into).collect());
        self
    }

    pub fn accept_if(mut self, f: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.accept = OriginPolicy::predicate(f);
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn queue_while_connecting(mut self, queue: bool) -> Self {
        self.queue_while_connecting = queue;
        self
    }

    pub fn max_queued(mut self, max: usize) -> Self {
        self.max_queued = max;
        self
    }

    pub fn max_frame_len(mut self, max: usize) -> Self {
        self.max_frame_len = max;
        self
    }
}

fn env_positive(key: &str) -> Option<u64> {
    parse_positive(std::env::var(key).ok()?.as_str())
}

fn parse_positive(raw: &str) -> Option<u64> {
    raw.trim().parse::<u64>().ok().filter(|v| *v > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_policies() {
        assert!(OriginPolicy::Any.allows("anything"));

        let exact = OriginPolicy::Exact(vec!["https://host.example".into()]);
        assert!(exact.allows("https://host.example"));
        assert!(!exact.allows("https://host.example.evil"));

        let suffix = OriginPolicy::predicate(|o| o.ends_with(".example"));
        assert!(suffix.allows("https://app.example"));
        assert!(!suffix.allows("https://app.test"));
    }

    #[test]
    fn test_builder_sets_fields() {
        let config = ChannelConfig::new("https://guest.example")
            .accept_origins(["https://host.example"])
            .handshake_timeout(Duration::from_millis(250))
            .queue_while_connecting(false)
            .max_queued(4);

        assert_eq!(config.origin, "https://guest.example");
        assert!(config.accept.allows("https://host.example"));
        assert!(!config.accept.allows("https://other.example"));
        assert_eq!(config.handshake_timeout, Duration::from_millis(250));
        assert!(!config.queue_while_connecting);
        assert_eq!(config.max_queued, 4);
    }

    #[test]
    fn test_from_env_overlays_defaults() {
        // SAFETY: no other test in this binary touches the PLUGBRIDGE_* variables.
        unsafe {
            std::env::set_var(HANDSHAKE_TIMEOUT_ENV, "1500");
            std::env::set_var(MAX_QUEUED_ENV, "0");
        }
        let config = ChannelConfig::from_env();
        unsafe {
            std::env::remove_var(HANDSHAKE_TIMEOUT_ENV);
            std::env::remove_var(MAX_QUEUED_ENV);
        }

        assert_eq!(config.handshake_timeout, Duration::from_millis(1500));
        assert_eq!(config.max_queued, DEFAULT_MAX_QUEUED);
        assert_eq!(config.origin, "local");
        assert!(config.queue_while_connecting);
    }

    #[test]
    fn test_parse_positive_ignores_junk_and_zero() {
        assert_eq!(parse_positive("1500"), Some(1500));
        assert_eq!(parse_positive(" 42 "), Some(42));
        assert_eq!(parse_positive("0"), None);
        assert_eq!(parse_positive("soon"), None);
    }
}
