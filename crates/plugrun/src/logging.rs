//! Tracing setup for binaries and tests embedding a guest or host.

use tracing_subscriber::EnvFilter;

/// Environment variable holding an `EnvFilter` directive, e.g. `plugrun=debug`.
pub const LOG_ENV: &str = "PLUGBRIDGE_LOG";

/// Installs a global fmt subscriber filtered by `PLUGBRIDGE_LOG`, falling
/// back to `default_directive`.
///
/// Returns false if a subscriber was already installed, so it is safe to call
/// from every test.
pub fn init(default_directive: &str) -> bool {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}

/// Interprets a guest-requested level name (`"warn"`, `"DEBUG"`, ...).
pub fn parse_level(level: &str) -> Option<tracing::Level> {
    level.trim().parse().ok()
}
