//! Subscription and broker configuration.
//!
//! Serde-backed structs with defaults for every field, loadable from a
//! TOML file with an environment fallback.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Which selector strategy a key-shared subscription uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeySharedMode {
    /// The broker owns the split of the hash space.
    AutoSplit,
    /// Consumers claim explicit hash ranges at subscribe time.
    Sticky,
}

/// Decides whether a joining consumer gets fenced: receives the number of
/// entries between the first unacknowledged message and the read position,
/// and the live consumer count.
pub type JoinFencePredicate = Arc<dyn Fn(u64, usize) -> bool + Send + Sync>;

/// Inherited heuristic: fence only when more than one entry is in flight
/// ahead of the mark-delete position.
pub fn default_join_fence_predicate() -> JoinFencePredicate {
    Arc::new(|entries_since_first_unacked, _consumers| entries_since_first_unacked > 1)
}

/// Per-subscription dispatch options.
///
/// `allow_out_of_order_delivery` is read once at dispatcher construction;
/// changing it requires a new subscription.
#[derive(Clone, Serialize, Deserialize)]
pub struct SubscriptionOptions {
    #[serde(default = "default_mode")]
    pub key_shared_mode: KeySharedMode,

    /// Drop the ordering fence and individually-sent tracking entirely.
    #[serde(default)]
    pub allow_out_of_order_delivery: bool,

    /// AutoSplit only: place consumers on a consistent-hash ring instead
    /// of recomputing equal ranges on every membership change.
    #[serde(default = "default_true")]
    pub use_consistent_hashing: bool,

    /// Ring points per consumer (AutoSplit with consistent hashing).
    #[serde(default = "default_replica_points")]
    pub consistent_hashing_replica_points: u32,

    /// Max entries per normal read.
    #[serde(default = "default_read_batch")]
    pub read_batch_size: usize,

    /// Max positions per replay read.
    #[serde(default = "default_replay_batch")]
    pub replay_batch_size: usize,

    /// Poll interval while idle with nothing to wake us.
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,

    #[serde(skip, default = "default_join_fence_predicate")]
    pub join_fence_predicate: JoinFencePredicate,
}

fn default_mode() -> KeySharedMode {
    KeySharedMode::AutoSplit
}

fn default_true() -> bool {
    true
}

fn default_replica_points() -> u32 {
    100
}

fn default_read_batch() -> usize {
    100
}

fn default_replay_batch() -> usize {
    64
}

fn default_idle_poll_ms() -> u64 {
    50
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            key_shared_mode: default_mode(),
            allow_out_of_order_delivery: false,
            use_consistent_hashing: true,
            consistent_hashing_replica_points: default_replica_points(),
            read_batch_size: default_read_batch(),
            replay_batch_size: default_replay_batch(),
            idle_poll_ms: default_idle_poll_ms(),
            join_fence_predicate: default_join_fence_predicate(),
        }
    }
}

impl fmt::Debug for SubscriptionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionOptions")
            .field("key_shared_mode", &self.key_shared_mode)
            .field(
                "allow_out_of_order_delivery",
                &self.allow_out_of_order_delivery,
            )
            .field("use_consistent_hashing", &self.use_consistent_hashing)
            .field(
                "consistent_hashing_replica_points",
                &self.consistent_hashing_replica_points,
            )
            .field("read_batch_size", &self.read_batch_size)
            .field("replay_batch_size", &self.replay_batch_size)
            .field("idle_poll_ms", &self.idle_poll_ms)
            .finish()
    }
}

impl SubscriptionOptions {
    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }
}

/// Top-level configuration of the demo broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub subscription: SubscriptionOptions,

    /// Ledger roll-over threshold of the in-memory log.
    #[serde(default = "default_entries_per_ledger")]
    pub entries_per_ledger: u64,
}

fn default_entries_per_ledger() -> u64 {
    1000
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            subscription: SubscriptionOptions::default(),
            entries_per_ledger: default_entries_per_ledger(),
        }
    }
}

impl BrokerConfig {
    /// Load from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load from `FANOUT_CONFIG_PATH` or fall back to defaults.
    pub fn from_env() -> Self {
        let path =
            std::env::var("FANOUT_CONFIG_PATH").unwrap_or_else(|_| "fanout.toml".to_string());
        Self::load(&path).unwrap_or_else(|e| {
            tracing::debug!("Using default broker config ({}): {}", path, e);
            Self::default()
        })
    }
}
