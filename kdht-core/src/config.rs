//! Layered node configuration, following the teacher's nested
//! `serde`-derived config structs loaded through the `config` crate rather
//! than hand-parsed environment variables.

use serde::{Deserialize, Serialize};

/// Routing-metadata timing knobs (spec §4.1 / §6 defaults).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingMetaConfig {
    /// `NODE_TIMEOUT`: age past which a node is no longer `good`.
    pub node_timeout_secs: u64,
    /// `RANGE_TIMEOUT`: max idle time before a range needs refresh.
    pub range_timeout_secs: u64,
    /// `node_timeout_count` threshold past which a node becomes `bad`.
    pub bad_timeout_count: u32,
}

impl Default for RoutingMetaConfig {
    fn default() -> Self {
        Self {
            node_timeout_secs: 15 * 60,
            range_timeout_secs: 15 * 60,
            bad_timeout_count: 2,
        }
    }
}

/// Net-correlator timing and sizing knobs (spec §6 defaults).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    pub query_timeout_ms: u64,
    pub token_lifetime_secs: u64,
    pub token_queue_len: usize,
    pub udp_mailbox_sz: usize,
    pub tag_alloc_retries: u32,
    pub bind_ip: String,
    pub bind_port: u16,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            query_timeout_ms: 2_000,
            token_lifetime_secs: 300,
            token_queue_len: 3,
            udp_mailbox_sz: 16,
            tag_alloc_retries: 16,
            bind_ip: "0.0.0.0".to_string(),
            bind_port: 6881,
        }
    }
}

/// Top-level node configuration, assembled by [`NodeConfig::load`] from a
/// config file overlaid with `KDHT_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NodeConfig {
    pub routing_meta: RoutingMetaConfig,
    pub net: NetConfig,
}

impl NodeConfig {
    /// Load configuration from an optional file path, overlaid with
    /// `KDHT_`-prefixed environment variables (e.g. `KDHT_NET__BIND_PORT`).
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("KDHT")
                .separator("__")
                .try_parsing(true),
        );
        builder.build()?.try_deserialize()
    }
}
