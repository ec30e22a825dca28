use async_trait::async_trait;
use model::config::ControlPlaneSnapshot;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::pause::sleep_or_cancelled;

/// External oracle deciding which workspaces are temporarily excluded from
/// scheduling.
#[async_trait]
pub trait DegradedOracle: Send + Sync {
    async fn degraded_workspaces(&self) -> Vec<String>;
}

/// Oracle backed by a plain set; the embedding application (or a test)
/// updates it out of band.
#[derive(Debug, Default)]
pub struct FixedDegradedOracle {
    workspaces: RwLock<HashSet<String>>,
}

impl FixedDegradedOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set<I>(&self, workspaces: I)
    where
        I: IntoIterator<Item = String>,
    {
        *self.workspaces.write().await = workspaces.into_iter().collect();
    }
}

#[async_trait]
impl DegradedOracle for FixedDegradedOracle {
    async fn degraded_workspaces(&self) -> Vec<String> {
        self.workspaces.read().await.iter().cloned().collect()
    }
}

/// Fans the control-plane config stream out to routers and caches the
/// degraded-workspace set so claim passes don't block on the oracle.
pub struct TenantManager {
    config_rx: watch::Receiver<Arc<ControlPlaneSnapshot>>,
    oracle: Arc<dyn DegradedOracle>,
    degraded: RwLock<Vec<String>>,
    refresh_interval: Duration,
}

impl TenantManager {
    pub fn new(
        config_rx: watch::Receiver<Arc<ControlPlaneSnapshot>>,
        oracle: Arc<dyn DegradedOracle>,
        refresh_interval: Duration,
    ) -> Self {
        Self {
            config_rx,
            oracle,
            degraded: RwLock::new(Vec::new()),
            refresh_interval,
        }
    }

    /// A fresh subscription to config snapshots. The receiver's current value
    /// is the latest push (an empty map before the first one).
    pub fn watch_config(&self) -> watch::Receiver<Arc<ControlPlaneSnapshot>> {
        self.config_rx.clone()
    }

    pub async fn degraded_workspaces(&self) -> Vec<String> {
        self.degraded.read().await.clone()
    }

    pub async fn degraded_workspace(&self, workspace_id: &str) -> bool {
        self.degraded
            .read()
            .await
            .iter()
            .any(|id| id == workspace_id)
    }

    /// Periodically re-reads the oracle until cancelled. One instance runs
    /// per router; refreshes are idempotent.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            self.refresh().await;
            if sleep_or_cancelled(&cancel, self.refresh_interval).await {
                break;
            }
        }
    }

    /// Re-read the oracle once. The watcher task calls this on its interval;
    /// embedders may call it directly after changing the oracle.
    pub async fn refresh(&self) {
        let workspaces = self.oracle.degraded_workspaces().await;
        if !workspaces.is_empty() {
            warn!(count = workspaces.len(), "workspaces in degraded mode");
        } else {
            debug!("no degraded workspaces");
        }
        *self.degraded.write().await = workspaces;
    }
}

/// Handle for pushing control-plane snapshots into the scheduler; the
/// embedding application owns the sender side.
pub fn config_channel() -> (
    watch::Sender<Arc<ControlPlaneSnapshot>>,
    watch::Receiver<Arc<ControlPlaneSnapshot>>,
) {
    watch::channel(Arc::new(ControlPlaneSnapshot::new()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn refresh_caches_oracle_view() {
        let oracle = Arc::new(FixedDegradedOracle::new());
        oracle.set(vec!["ws-bad".to_string()]).await;

        let (_tx, rx) = config_channel();
        let manager = TenantManager::new(rx, oracle.clone(), Duration::from_secs(30));

        assert!(manager.degraded_workspaces().await.is_empty());
        manager.refresh().await;
        assert!(manager.degraded_workspace("ws-bad").await);
        assert!(!manager.degraded_workspace("ws-good").await);

        oracle.set(Vec::new()).await;
        manager.refresh().await;
        assert!(manager.degraded_workspaces().await.is_empty());
    }
}
