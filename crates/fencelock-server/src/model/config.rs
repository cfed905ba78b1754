//! Configuration management for the Fencelock server
//!
//! Sources, lowest precedence first: the optional YAML file, `FENCELOCK_`
//! environment variables, then command-line overrides.

use clap::Parser;
use config::{Config, ConfigError, Environment, File};
use fencelock_common::DEFAULT_REGION;
use fencelock_consistency::NodeId;
use fencelock_core::model::NodeConfig;

use crate::startup::{LogRotation, LoggingConfig};

pub const DEFAULT_CONFIG_FILE: &str = "conf/fencelock";
pub const DEFAULT_CLUSTER_NODES: usize = 3;

/// Command line arguments for the server
#[derive(Debug, Default, Parser)]
#[command(name = "fencelock-server", about = "Fencing-token distributed lock service")]
pub struct Cli {
    /// Configuration file, with or without extension
    #[arg(short = 'c', long = "config", env = "FENCELOCK_CONFIG")]
    pub config: Option<String>,
    /// Node the console contacts first
    #[arg(long = "node-id")]
    pub node_id: Option<String>,
    /// Region served by the console
    #[arg(short = 'r', long = "region")]
    pub region: Option<String>,
    /// Nodes per simulated region
    #[arg(short = 'n', long = "nodes")]
    pub nodes: Option<usize>,
    #[arg(long = "log-level")]
    pub log_level: Option<String>,
}

/// Application configuration loaded from config files and environment
#[derive(Clone, Debug, Default)]
pub struct Configuration {
    pub config: Config,
}

impl Configuration {
    pub fn load(cli: &Cli) -> Result<Self, ConfigError> {
        let file = cli.config.as_deref().unwrap_or(DEFAULT_CONFIG_FILE);
        let mut builder = Config::builder()
            .add_source(File::with_name(file).required(cli.config.is_some()))
            .add_source(
                Environment::with_prefix("FENCELOCK")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        if let Some(v) = &cli.node_id {
            builder = builder.set_override("node.id", v.as_str())?;
        }
        if let Some(v) = &cli.region {
            builder = builder.set_override("region.id", v.as_str())?;
        }
        if let Some(v) = cli.nodes {
            builder = builder.set_override("cluster.nodes", v as i64)?;
        }
        if let Some(v) = &cli.log_level {
            builder = builder.set_override("logs.level", v.as_str())?;
        }

        Ok(Configuration {
            config: builder.build()?,
        })
    }

    fn get_u64(&self, key: &str, default: u64) -> u64 {
        self.config
            .get_int(key)
            .ok()
            .and_then(|v| u64::try_from(v).ok())
            .unwrap_or(default)
    }

    // ========================================================================
    // Topology
    // ========================================================================

    pub fn region_id(&self) -> String {
        self.config
            .get_string("region.id")
            .unwrap_or(DEFAULT_REGION.to_string())
    }

    /// Every simulated region, the console's own region first
    pub fn regions(&self) -> Vec<String> {
        let home = self.region_id();
        let mut regions = vec![home.clone()];
        if let Ok(peers) = self.config.get::<Vec<String>>("region.peers") {
            for peer in peers {
                if !regions.contains(&peer) {
                    regions.push(peer);
                }
            }
        }
        regions
    }

    pub fn cluster_nodes(&self) -> usize {
        self.config
            .get_int("cluster.nodes")
            .ok()
            .and_then(|v| usize::try_from(v).ok())
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_CLUSTER_NODES)
    }

    /// Node ids of `region`
    ///
    /// The home region's nodes are `node.id` followed by generated ids; other
    /// regions are prefixed with their region id.
    pub fn node_ids(&self, region: &str) -> Vec<NodeId> {
        let count = self.cluster_nodes();
        let mut ids: Vec<NodeId> = Vec::with_capacity(count);
        if region == self.region_id()
            && let Ok(first) = self.config.get_string("node.id")
        {
            ids.push(first);
        }
        let mut i = 1;
        while ids.len() < count {
            let id = if region == self.region_id() {
                format!("node-{}", i)
            } else {
                format!("{}-node-{}", region, i)
            };
            if !ids.contains(&id) {
                ids.push(id);
            }
            i += 1;
        }
        ids
    }

    /// Full configuration of one node
    pub fn node_config(&self, node_id: &str, region: &str) -> NodeConfig {
        let peers = self.node_ids(region);
        let peer_regions = self
            .regions()
            .into_iter()
            .filter(|r| r != region)
            .collect();
        let mut config = NodeConfig::new(node_id, peers, region, peer_regions);
        self.apply_tuning(&mut config);
        config
    }

    fn apply_tuning(&self, config: &mut NodeConfig) {
        let raft = &mut config.raft;
        raft.election_timeout_ms = self.get_u64("raft.election_timeout_ms", raft.election_timeout_ms);
        raft.election_jitter_ms = self.get_u64("raft.election_jitter_ms", raft.election_jitter_ms);
        raft.heartbeat_interval_ms =
            self.get_u64("raft.heartbeat_interval_ms", raft.heartbeat_interval_ms);
        raft.vote_rpc_timeout_ms = self.get_u64("raft.vote_rpc_timeout_ms", raft.vote_rpc_timeout_ms);
        raft.append_rpc_timeout_ms =
            self.get_u64("raft.append_rpc_timeout_ms", raft.append_rpc_timeout_ms);
        raft.max_payload_entries = self.get_u64("raft.max_payload_entries", raft.max_payload_entries);
        raft.commit_timeout_ms = self.get_u64("raft.commit_timeout_ms", raft.commit_timeout_ms);

        let quorum = &mut config.quorum;
        quorum.quorum_size = self
            .config
            .get_int("quorum.size")
            .ok()
            .and_then(|v| usize::try_from(v).ok())
            .filter(|v| *v > 0)
            .unwrap_or(quorum.quorum_size);
        quorum.quorum_timeout_ms = self.get_u64("quorum.timeout_ms", quorum.quorum_timeout_ms);
        quorum.vote_timeout_ms = self.get_u64("quorum.vote_timeout_ms", quorum.vote_timeout_ms);
        quorum.pending_vote_ttl_ms =
            self.get_u64("quorum.pending_vote_ttl_ms", quorum.pending_vote_ttl_ms);

        let lock = &mut config.lock;
        lock.default_timeout_ms = self.get_u64("lock.default_timeout_ms", lock.default_timeout_ms);
        lock.min_timeout_ms = self.get_u64("lock.min_timeout_ms", lock.min_timeout_ms);
        lock.max_timeout_ms = self.get_u64("lock.max_timeout_ms", lock.max_timeout_ms);
        lock.sweep_interval_ms = self.get_u64("lock.sweep_interval_ms", lock.sweep_interval_ms);

        let client = &mut config.region_client;
        client.request_timeout_ms =
            self.get_u64("region_client.request_timeout_ms", client.request_timeout_ms);
        client.max_retries = self.get_u64("region_client.max_retries", client.max_retries as u64) as u32;
        client.retry_delay_ms = self.get_u64("region_client.retry_delay_ms", client.retry_delay_ms);
        client.failure_threshold = self.get_u64(
            "region_client.failure_threshold",
            client.failure_threshold as u64,
        ) as u32;
        client.reset_timeout_ms =
            self.get_u64("region_client.reset_timeout_ms", client.reset_timeout_ms);
        client.success_threshold = self.get_u64(
            "region_client.success_threshold",
            client.success_threshold as u64,
        ) as u32;
    }

    // ========================================================================
    // Logging
    // ========================================================================

    pub fn logging_config(&self) -> LoggingConfig {
        LoggingConfig::from_config(
            self.config.get_string("logs.path").ok(),
            self.config.get_bool("logs.console").unwrap_or(false),
            self.config.get_bool("logs.file").unwrap_or(true),
            self.config.get_string("logs.level").ok(),
            self.config
                .get_string("logs.rotation")
                .ok()
                .and_then(|r| r.parse().ok())
                .unwrap_or(LogRotation::Daily),
        )
    }
}
