// In-process deployment: every configured region runs its nodes on local transports

use std::sync::Arc;
use std::time::Duration;

use fencelock_core::LeaderForwarder;
use fencelock_core::transport::{LocalRegion, LocalRegionDirectory};
use tracing::info;

use crate::model::Configuration;

/// All simulated regions plus a forwarder into the home region
pub struct LocalDeployment {
    home_region: String,
    directory: Arc<LocalRegionDirectory>,
    regions: Vec<LocalRegion>,
    forwarder: LeaderForwarder,
}

impl LocalDeployment {
    /// Start every region and wait for each to elect a leader
    pub async fn start(configuration: &Configuration, leader_wait: Duration) -> anyhow::Result<Self> {
        let home_region = configuration.region_id();
        let region_ids = configuration.regions();
        let region_refs: Vec<&str> = region_ids.iter().map(String::as_str).collect();
        let directory = LocalRegionDirectory::new();

        let mut regions = Vec::with_capacity(region_ids.len());
        for region_id in &region_ids {
            let node_ids = configuration.node_ids(region_id);
            let node_refs: Vec<&str> = node_ids.iter().map(String::as_str).collect();
            let region = LocalRegion::start(
                &directory,
                region_id,
                &node_refs,
                &region_refs,
                |config| *config = configuration.node_config(&config.node_id, &config.region_id),
            );
            info!(region = %region_id, nodes = ?node_ids, "Region started");
            regions.push(region);
        }

        for region in &regions {
            let leader = region.wait_for_leader(leader_wait).await.ok_or_else(|| {
                anyhow::anyhow!(
                    "region {} elected no leader within {}ms",
                    region.region_id(),
                    leader_wait.as_millis()
                )
            })?;
            info!(region = %region.region_id(), leader = %leader.node_id(), "Region leader elected");
        }

        let home = regions
            .iter()
            .find(|r| r.region_id() == home_region)
            .ok_or_else(|| anyhow::anyhow!("home region {} was not started", home_region))?;
        let sample = configuration.node_config("", &home_region);
        let forwarder = home.forwarder(sample.quorum.quorum_timeout() + sample.raft.commit_timeout());

        Ok(Self {
            home_region,
            directory,
            regions,
            forwarder,
        })
    }

    pub fn home_region(&self) -> &str {
        &self.home_region
    }

    pub fn directory(&self) -> &Arc<LocalRegionDirectory> {
        &self.directory
    }

    pub fn regions(&self) -> &[LocalRegion] {
        &self.regions
    }

    pub fn region(&self, region_id: &str) -> Option<&LocalRegion> {
        self.regions.iter().find(|r| r.region_id() == region_id)
    }

    pub fn forwarder(&self) -> &LeaderForwarder {
        &self.forwarder
    }

    pub fn shutdown(&self) {
        for region in &self.regions {
            region.shutdown();
        }
        info!("Deployment stopped");
    }
}
