//! Engine configuration.
//!
//! [`TmConfig`] is read through a [`ConfigHandle`]. Each transaction clones the
//! current `Arc<TmConfig>` when it is created and keeps it for its whole
//! lifetime, so a configuration update never changes the timers of a
//! transaction that is already running.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::timer::TimerSettings;

/// Hard upper bound on branches per transaction (size of the cancel bitmap).
pub const MAX_BRANCHES_LIMIT: usize = 32;

/// What `cancel_branch` does with a branch that has not received any reply yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelMode {
    /// Stop retransmitting and fake a 487 so the branch stops blocking selection.
    FakeReply,
    /// Stop retransmitting and wait; a late provisional triggers the CANCEL.
    StopRetransmission,
    /// Send a CANCEL even though nothing was received on the branch.
    SendCancel,
}

/// Policy for stored branch replies when a failure route forks again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    KeepAll,
    DropAll,
    DropLastForkGroup,
}

/// Runtime configuration of the transaction engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TmConfig {
    pub timers: TimerSettings,
    /// Maximum number of branches per transaction, at most [`MAX_BRANCHES_LIMIT`].
    pub max_branches: usize,
    pub cancel_mode: CancelMode,
    /// Priority penalty added to locally faked replies.
    pub faked_reply_prio: u32,
    /// Reply 408 on an INVITE that timed out without any answer even when it
    /// has a single branch and no failure route.
    pub noisy_ctimer: bool,
    /// Send 100 Trying upstream as soon as an INVITE transaction is created.
    pub auto_inv_100: bool,
    /// Relay a winning 503 upstream as 500.
    pub remap_503_500: bool,
    /// Restart the INVITE final deadline on every provisional, not only the first.
    pub restart_fr_on_each_reply: bool,
    /// Check the blacklist before sending and blacklist failed destinations.
    pub use_blacklist: bool,
    #[serde(with = "duration_ms")]
    pub blacklist_ttl: Duration,
    /// Blacklist the source of a 503 for its Retry-After interval.
    pub blacklist_503: bool,
    #[serde(with = "duration_ms")]
    pub blacklist_503_default_ttl: Duration,
    #[serde(with = "duration_ms")]
    pub blacklist_503_min_ttl: Duration,
    #[serde(with = "duration_ms")]
    pub blacklist_503_max_ttl: Duration,
    /// Try the next resolver candidate after a send failure, blacklist hit or 503.
    pub failover: bool,
    /// Also fail over when a branch times out without having received any reply.
    pub failover_on_timeout: bool,
    /// Default drop policy when a failure route does not pick one.
    pub default_drop_policy: DropPolicy,
}

impl Default for TmConfig {
    fn default() -> Self {
        Self {
            timers: TimerSettings::default(),
            max_branches: 12,
            cancel_mode: CancelMode::FakeReply,
            faked_reply_prio: 0,
            noisy_ctimer: true,
            auto_inv_100: true,
            remap_503_500: true,
            restart_fr_on_each_reply: true,
            use_blacklist: true,
            blacklist_ttl: Duration::from_secs(60),
            blacklist_503: false,
            blacklist_503_default_ttl: Duration::ZERO,
            blacklist_503_min_ttl: Duration::ZERO,
            blacklist_503_max_ttl: Duration::from_secs(3600),
            failover: true,
            failover_on_timeout: true,
            default_drop_policy: DropPolicy::KeepAll,
        }
    }
}

impl TmConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: TmConfig = toml::from_str(s).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_branches == 0 || self.max_branches > MAX_BRANCHES_LIMIT {
            return Err(Error::Config(format!(
                "max_branches must be in 1..={}, got {}",
                MAX_BRANCHES_LIMIT, self.max_branches
            )));
        }
        if self.timers.t1.is_zero() || self.timers.t2 < self.timers.t1 {
            return Err(Error::Config("timers require 0 < t1 <= t2".to_string()));
        }
        if self.timers.tick.is_zero() {
            return Err(Error::Config("timer tick must not be zero".to_string()));
        }
        if self.blacklist_503_min_ttl > self.blacklist_503_max_ttl {
            return Err(Error::Config("blacklist_503_min_ttl exceeds blacklist_503_max_ttl".to_string()));
        }
        Ok(())
    }

    pub fn with_timers(mut self, timers: TimerSettings) -> Self {
        self.timers = timers;
        self
    }

    pub fn with_max_branches(mut self, max: usize) -> Self {
        self.max_branches = max.clamp(1, MAX_BRANCHES_LIMIT);
        self
    }

    pub fn with_cancel_mode(mut self, mode: CancelMode) -> Self {
        self.cancel_mode = mode;
        self
    }

    pub fn with_faked_reply_prio(mut self, prio: u32) -> Self {
        self.faked_reply_prio = prio;
        self
    }

    pub fn with_noisy_ctimer(mut self, noisy: bool) -> Self {
        self.noisy_ctimer = noisy;
        self
    }

    pub fn with_auto_inv_100(mut self, enabled: bool) -> Self {
        self.auto_inv_100 = enabled;
        self
    }

    pub fn with_failover(mut self, enabled: bool) -> Self {
        self.failover = enabled;
        self
    }

    pub fn with_blacklist(mut self, enabled: bool) -> Self {
        self.use_blacklist = enabled;
        self
    }

    pub fn with_blacklist_503(mut self, enabled: bool) -> Self {
        self.blacklist_503 = enabled;
        self
    }

    pub fn with_default_drop_policy(mut self, policy: DropPolicy) -> Self {
        self.default_drop_policy = policy;
        self
    }

    /// TTL used when blacklisting the source of a 503.
    pub fn blacklist_503_ttl(&self, retry_after: Option<u32>) -> Duration {
        let ttl = retry_after
            .map(|s| Duration::from_secs(u64::from(s)))
            .unwrap_or(self.blacklist_503_default_ttl);
        ttl.clamp(self.blacklist_503_min_ttl, self.blacklist_503_max_ttl)
    }
}

/// Shared, swappable configuration.
#[derive(Debug)]
pub struct ConfigHandle {
    current: RwLock<Arc<TmConfig>>,
}

impl ConfigHandle {
    pub fn new(config: TmConfig) -> Self {
        Self { current: RwLock::new(Arc::new(config)) }
    }

    /// The configuration new transactions will be created with.
    pub fn snapshot(&self) -> Arc<TmConfig> {
        self.current.read().clone()
    }

    pub fn update(&self, config: TmConfig) -> Result<()> {
        config.validate()?;
        *self.current.write() = Arc::new(config);
        Ok(())
    }
}

/// Serializes a `Duration` as whole milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
