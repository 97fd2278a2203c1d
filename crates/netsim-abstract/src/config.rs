use serde::{Deserialize, Serialize};

/// Which enqueuers are subject to a link's buffer limit.
///
/// The default models tail-drop at router egress: hosts behave like an
/// idealized NIC and are never buffer-limited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferPolicy {
    #[default]
    RouterEgress,
    AllDevices,
    Unbounded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimConfig {
    pub seed: u64,
    /// Interval between statistics samples; 0 disables sampling
    pub stats_interval_ms: u64,
    /// Maximum number of points kept per statistics series
    pub stats_retention: usize,
    pub broadcast_cache_ttl_ms: u64,
    pub buffer_policy: BufferPolicy,
    pub max_syn_retries: u32,
    pub initial_rto_ms: u64,
    pub min_rto_ms: u64,
    pub max_rto_ms: u64,
    /// Consecutive retransmission timeouts after which a flow stops retrying
    pub max_consecutive_timeouts: u32,
    /// Maximum number of entries kept in the report's event log
    pub event_log_limit: usize,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            stats_interval_ms: 1_000,
            stats_retention: 80,
            broadcast_cache_ttl_ms: 60_000,
            buffer_policy: BufferPolicy::default(),
            max_syn_retries: 5,
            initial_rto_ms: 1_000,
            min_rto_ms: 100,
            max_rto_ms: 60_000,
            max_consecutive_timeouts: 12,
            event_log_limit: 10_000,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct SimConfigOverride {
    pub seed: Option<u64>,
    pub stats_interval_ms: Option<u64>,
    pub stats_retention: Option<usize>,
    pub broadcast_cache_ttl_ms: Option<u64>,
    pub buffer_policy: Option<BufferPolicy>,
    pub max_syn_retries: Option<u32>,
    pub initial_rto_ms: Option<u64>,
    pub min_rto_ms: Option<u64>,
    pub max_rto_ms: Option<u64>,
    pub max_consecutive_timeouts: Option<u32>,
    pub event_log_limit: Option<usize>,
}

impl SimConfigOverride {
    pub fn apply_to(&self, config: &mut SimConfig) {
        if let Some(v) = self.seed {
            config.seed = v;
        }
        if let Some(v) = self.stats_interval_ms {
            config.stats_interval_ms = v;
        }
        if let Some(v) = self.stats_retention {
            config.stats_retention = v;
        }
        if let Some(v) = self.broadcast_cache_ttl_ms {
            config.broadcast_cache_ttl_ms = v;
        }
        if let Some(v) = self.buffer_policy {
            config.buffer_policy = v;
        }
        if let Some(v) = self.max_syn_retries {
            config.max_syn_retries = v;
        }
        if let Some(v) = self.initial_rto_ms {
            config.initial_rto_ms = v;
        }
        if let Some(v) = self.min_rto_ms {
            config.min_rto_ms = v;
        }
        if let Some(v) = self.max_rto_ms {
            config.max_rto_ms = v;
        }
        if let Some(v) = self.max_consecutive_timeouts {
            config.max_consecutive_timeouts = v;
        }
        if let Some(v) = self.event_log_limit {
            config.event_log_limit = v;
        }
    }
}
