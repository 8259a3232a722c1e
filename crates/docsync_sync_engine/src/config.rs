//! Configuration for the sync engine.

use crate::error::{SyncError, SyncResult};
use std::fmt;
use std::time::Duration;
use url::Url;

/// Remote endpoint URL.
pub const ENV_REMOTE_URL: &str = "DOCSYNC_REMOTE_URL";
/// Remote user name.
pub const ENV_REMOTE_USERNAME: &str = "DOCSYNC_REMOTE_USERNAME";
/// Remote password.
pub const ENV_REMOTE_PASSWORD: &str = "DOCSYNC_REMOTE_PASSWORD";
/// Remote database name.
pub const ENV_REMOTE_DB: &str = "DOCSYNC_REMOTE_DB";
/// `true`/`false`, whether sync runs at all.
pub const ENV_SYNC_ENABLED: &str = "DOCSYNC_SYNC_ENABLED";
/// Periodic sync interval in milliseconds.
pub const ENV_SYNC_INTERVAL_MS: &str = "DOCSYNC_SYNC_INTERVAL_MS";

/// Database used when none is configured.
pub const DEFAULT_DATABASE: &str = "docsync";

/// Where and how to reach the remote replica.
#[derive(Clone, PartialEq, Eq)]
pub struct RemoteConfig {
    /// Server base URL.
    pub url: Url,
    /// User name for HTTP Basic auth.
    pub username: Option<String>,
    /// Password for HTTP Basic auth.
    pub password: Option<String>,
    /// Database (collection) name on the server.
    pub database: String,
}

impl RemoteConfig {
    /// Parses `url` and targets `database`.
    ///
    /// # Errors
    ///
    /// [`SyncError::Config`] if the URL does not parse or cannot carry a path.
    pub fn new(url: &str, database: impl Into<String>) -> SyncResult<Self> {
        let url = Url::parse(url)
            .map_err(|e| SyncError::config(format!("invalid remote url {url:?}: {e}")))?;
        if url.cannot_be_a_base() {
            return Err(SyncError::config(format!("remote url {url} cannot be a base")));
        }
        Ok(Self {
            url,
            username: None,
            password: None,
            database: database.into(),
        })
    }

    /// Sets the credential pair.
    #[must_use]
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }
}

impl fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteConfig")
            .field("url", &self.url.as_str())
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("database", &self.database)
            .finish()
    }
}

/// Exponential backoff schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Upper bound for any delay.
    pub max_delay: Duration,
    /// Growth factor between consecutive failures.
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 1.5,
        }
    }
}

impl BackoffConfig {
    /// Sets the initial delay.
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the multiplier.
    #[must_use]
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Delay before retry number `attempt` (1-indexed); zero for attempt 0.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

/// Tuning for one replication.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicationOptions {
    /// Keep running after both directions drain.
    pub live: bool,
    /// Back off and retry after transient failures.
    pub retry: bool,
    /// Changes per page.
    pub batch_size: usize,
    /// Pages per direction before switching to the other.
    pub batches_limit: usize,
    /// How often a paused live replication polls the remote.
    pub heartbeat: Duration,
    /// Overall time limit; `None` means run until stopped.
    pub timeout: Option<Duration>,
    /// Backoff between failed passes and between conflict retries.
    pub backoff: BackoffConfig,
    /// Re-reads allowed for a document whose write keeps conflicting.
    pub conflict_retries: u32,
}

impl Default for ReplicationOptions {
    fn default() -> Self {
        Self {
            live: true,
            retry: true,
            batch_size: 25,
            batches_limit: 5,
            heartbeat: Duration::from_secs(1),
            timeout: None,
            backoff: BackoffConfig::default(),
            conflict_retries: 5,
        }
    }
}

impl ReplicationOptions {
    /// Smallest accepted page size.
    pub const MIN_BATCH_SIZE: usize = 5;
    /// Largest accepted page size.
    pub const MAX_BATCH_SIZE: usize = 100;
    /// Smallest accepted pages-per-direction.
    pub const MIN_BATCHES_LIMIT: usize = 2;
    /// Largest accepted pages-per-direction.
    pub const MAX_BATCHES_LIMIT: usize = 10;

    /// A single pass that completes instead of staying live.
    #[must_use]
    pub fn one_shot() -> Self {
        Self {
            live: false,
            ..Self::default()
        }
    }

    /// Sets live mode.
    #[must_use]
    pub fn with_live(mut self, live: bool) -> Self {
        self.live = live;
        self
    }

    /// Sets automatic retry.
    #[must_use]
    pub fn with_retry(mut self, retry: bool) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the page size, clamped to `5..=100`.
    #[must_use]
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.clamp(Self::MIN_BATCH_SIZE, Self::MAX_BATCH_SIZE);
        self
    }

    /// Sets pages per direction, clamped to `2..=10`.
    #[must_use]
    pub fn with_batches_limit(mut self, limit: usize) -> Self {
        self.batches_limit = limit.clamp(Self::MIN_BATCHES_LIMIT, Self::MAX_BATCHES_LIMIT);
        self
    }

    /// Sets the heartbeat interval.
    #[must_use]
    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Sets an overall time limit.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the backoff schedule.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets how often a conflicting write is re-read and retried.
    #[must_use]
    pub fn with_conflict_retries(mut self, retries: u32) -> Self {
        self.conflict_retries = retries;
        self
    }
}

/// Configuration for the sync service.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Remote replica, if any.
    pub remote: Option<RemoteConfig>,
    /// Whether sync runs at all.
    pub enabled: bool,
    /// Periodic sync cadence; zero disables the timer.
    pub interval: Duration,
    /// Quiet window for debounced sync.
    pub debounce: Duration,
    /// Bound on connectivity probes.
    pub probe_timeout: Duration,
    /// Options used when a caller passes none.
    pub replication: ReplicationOptions,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            remote: None,
            enabled: false,
            interval: Duration::from_millis(30_000),
            debounce: Duration::from_millis(500),
            probe_timeout: Duration::from_secs(5),
            replication: ReplicationOptions::default(),
        }
    }
}

impl SyncConfig {
    /// Configuration with sync turned off.
    #[must_use]
    pub fn offline() -> Self {
        Self::default()
    }

    /// Enables sync against `remote`.
    #[must_use]
    pub fn with_remote(mut self, remote: RemoteConfig) -> Self {
        self.remote = Some(remote);
        self.enabled = true;
        self
    }

    /// Sets whether sync runs.
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Sets the periodic interval.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets the debounce window.
    #[must_use]
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Sets the probe timeout.
    #[must_use]
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Sets the default replication options.
    #[must_use]
    pub fn with_replication(mut self, options: ReplicationOptions) -> Self {
        self.replication = options;
        self
    }

    /// Checks that enabled sync has somewhere to go.
    ///
    /// # Errors
    ///
    /// [`SyncError::Config`] when sync is enabled without a remote.
    pub fn validate(&self) -> SyncResult<()> {
        if self.enabled && self.remote.is_none() {
            return Err(SyncError::config(format!(
                "sync is enabled but {ENV_REMOTE_URL} is not set"
            )));
        }
        Ok(())
    }

    /// Reads the configuration from the process environment.
    pub fn from_env() -> SyncResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from `lookup`, which maps variable names to
    /// values. Every variable is optional.
    ///
    /// # Errors
    ///
    /// [`SyncError::Config`] for an unparseable URL, flag or interval.
    pub fn from_lookup<F>(lookup: F) -> SyncResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut config = Self::default();

        if let Some(url) = get(ENV_REMOTE_URL) {
            let database = get(ENV_REMOTE_DB).unwrap_or_else(|| DEFAULT_DATABASE.to_string());
            let mut remote = RemoteConfig::new(&url, database)?;
            remote.username = get(ENV_REMOTE_USERNAME);
            remote.password = get(ENV_REMOTE_PASSWORD);
            config.remote = Some(remote);
        }

        if let Some(flag) = get(ENV_SYNC_ENABLED) {
            config.enabled = parse_bool(&flag).ok_or_else(|| {
                SyncError::config(format!("{ENV_SYNC_ENABLED} must be true or false, got {flag:?}"))
            })?;
        }

        if let Some(ms) = get(ENV_SYNC_INTERVAL_MS) {
            let ms: u64 = ms.parse().map_err(|_| {
                SyncError::config(format!(
                    "{ENV_SYNC_INTERVAL_MS} must be a number of milliseconds, got {ms:?}"
                ))
            })?;
            config.interval = Duration::from_millis(ms);
        }

        Ok(config)
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}
