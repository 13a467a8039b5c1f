//! Configuration for the reassembly protocol

/// Oldest a reassembly request may be, in seconds, before responders refuse it
pub const MAX_REQUEST_AGE: u64 = 3000;

/// Protocol tunables
///
/// Defaults match the wire protocol; tests and the CLI may tighten them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolConfig {
    max_request_age: u64,
}

impl ProtocolConfig {
    /// Creates a configuration with the default request lifetime
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_request_age: MAX_REQUEST_AGE,
        }
    }

    /// Overrides the request lifetime
    ///
    /// # Examples
    ///
    /// ```rust
    /// use twain::domain::ProtocolConfig;
    ///
    /// let config = ProtocolConfig::new().with_max_request_age(60);
    /// assert_eq!(config.max_request_age(), 60);
    /// ```
    #[must_use]
    pub const fn with_max_request_age(mut self, seconds: u64) -> Self {
        self.max_request_age = seconds;
        self
    }

    /// Gets the request lifetime in seconds
    #[must_use]
    pub const fn max_request_age(&self) -> u64 {
        self.max_request_age
    }

    /// Whether a request stamped at `timestamp` is still admissible at `now`
    ///
    /// Requests stamped further than the lifetime in the future are refused as well.
    #[must_use]
    pub const fn is_fresh(&self, timestamp: u64, now: u64) -> bool {
        if timestamp <= now {
            now - timestamp <= self.max_request_age
        } else {
            timestamp - now <= self.max_request_age
        }
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self::new()
    }
}
