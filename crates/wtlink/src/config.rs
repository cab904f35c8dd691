//! Bridge configuration.

use std::time::Duration;

/// Loopback port the host listens on unless configured otherwise.
pub const DEFAULT_PORT: u16 = 7000;

/// How many undelivered inbound payloads may queue before the receive loop
/// waits for the host to catch up.
pub const DEFAULT_INBOUND_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    pub port: u16,
    /// `None` waits for the worker indefinitely.
    pub accept_timeout: Option<Duration>,
    pub inbound_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            accept_timeout: None,
            inbound_capacity: DEFAULT_INBOUND_CAPACITY,
        }
    }
}

impl BridgeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read `WTLINK_PORT`, `WTLINK_ACCEPT_TIMEOUT_SECS` and
    /// `WTLINK_INBOUND_CAPACITY`, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like `from_env`, reading variables through `lookup`.
    ///
    /// Unparseable values are logged and ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(port) = parse_var(&lookup, "WTLINK_PORT") {
            config.port = port;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "WTLINK_ACCEPT_TIMEOUT_SECS") {
            // 0 disables the timeout
            config.accept_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(capacity) = parse_var::<usize>(&lookup, "WTLINK_INBOUND_CAPACITY") {
            if capacity == 0 {
                tracing::warn!("WTLINK_INBOUND_CAPACITY must be positive, using default");
            } else {
                config.inbound_capacity = capacity;
            }
        }

        config
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_accept_timeout(mut self, timeout: Duration) -> Self {
        self.accept_timeout = Some(timeout);
        self
    }

    pub fn with_inbound_capacity(mut self, capacity: usize) -> Self {
        self.inbound_capacity = capacity.max(1);
        self
    }
}

fn parse_var<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T::Err: std::fmt::Display,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(key, value = %raw, error = %e, "Ignoring invalid configuration value");
            None
        }
    }
}
