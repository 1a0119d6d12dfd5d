//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

use registry::config::RegistryConfig;
use registry::node::RegistryNode;
use registry::resource::Resource;
use tempfile::TempDir;

pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Config for a member listening on an ephemeral port with fast elections.
pub fn test_config(dir: &TempDir) -> RegistryConfig {
    let mut config = RegistryConfig::default();
    config.data.dir = dir.path().display().to_string();
    config.data.clusterbind = "127.0.0.1:0".to_string();
    config.data.heartbeatms = 50;
    config.data.electiontimeoutms = 200;
    config.common.httpbind = "127.0.0.1:8001".to_string();
    config.common.admins = vec!["root".to_string()];
    config.common.persist_report = 0;
    config
}

/// Starts a member that bootstraps its own cluster.
pub async fn start_single(dir: &TempDir) -> RegistryNode {
    RegistryNode::start(&test_config(dir), None).await.unwrap()
}

/// Starts a member that joins through `leader`.
pub async fn start_joined(dir: &TempDir, leader: &str) -> RegistryNode {
    RegistryNode::start(&test_config(dir), Some(leader)).await.unwrap()
}

pub fn resource(pairs: &[(&str, &str)]) -> Resource {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

/// Polls `check` every 20ms until it holds or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
