//! Store configuration.

/// Configuration for opening a [`crate::DocumentStore`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Whether to create the store directory if it doesn't exist.
    pub create_if_missing: bool,

    /// Whether to flush the journal after every write (safer but slower).
    pub sync_on_commit: bool,

    /// Number of change events buffered per live subscriber before it lags.
    pub feed_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            sync_on_commit: true,
            feed_capacity: 1024,
        }
    }
}

impl StoreConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the store if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets whether to flush the journal on every commit.
    #[must_use]
    pub const fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }

    /// Sets the per-subscriber change buffer. Zero is raised to one.
    #[must_use]
    pub const fn feed_capacity(mut self, capacity: usize) -> Self {
        self.feed_capacity = if capacity == 0 { 1 } else { capacity };
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = StoreConfig::default();
        assert!(config.create_if_missing);
        assert!(config.sync_on_commit);
        assert_eq!(config.feed_capacity, 1024);
    }

    #[test]
    fn builder() {
        let config = StoreConfig::new()
            .create_if_missing(false)
            .sync_on_commit(false)
            .feed_capacity(0);
        assert!(!config.create_if_missing);
        assert!(!config.sync_on_commit);
        assert_eq!(config.feed_capacity, 1);
    }
}
