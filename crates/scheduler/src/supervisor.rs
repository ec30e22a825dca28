use crate::error::SchedulerError;
use crate::router::{Router, RouterDeps};
use model::config::ControlPlaneSnapshot;
use model::destination::DestinationKind;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

/// Owns one router per warehouse destination kind and follows the config
/// stream: kinds appearing in a snapshot get a router (or are re-enabled),
/// kinds that vanish are disabled. Routers are never torn down while the
/// process lives — re-enabling is cheap, rebuilding is not.
pub struct Supervisor {
    deps: RouterDeps,
    routers: HashMap<DestinationKind, Router>,
}

impl Supervisor {
    pub fn new(deps: RouterDeps) -> Self {
        Self {
            deps,
            routers: HashMap::new(),
        }
    }

    /// Follow config snapshots until cancelled, then stop every router.
    /// Slave-only processes park here without starting any router.
    pub async fn run(mut self) -> Result<(), SchedulerError> {
        if !self.deps.settings.mode.is_master() {
            info!("process has no master role, destination routers stay off");
            self.deps.cancel.cancelled().await;
            return Ok(());
        }

        let mut rx = self.deps.tenant.watch_config();

        let current = rx.borrow_and_update().clone();
        if !current.is_empty() {
            self.apply(&current).await?;
        }

        loop {
            tokio::select! {
                _ = self.deps.cancel.cancelled() => break,
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let snapshot = rx.borrow_and_update().clone();
                    self.apply(&snapshot).await?;
                }
            }
        }

        self.shutdown().await
    }

    /// Reconcile the router map against one snapshot.
    pub async fn apply(&mut self, snapshot: &ControlPlaneSnapshot) -> Result<(), SchedulerError> {
        let mut enabled: HashSet<DestinationKind> = HashSet::new();
        for workspace in snapshot.values() {
            for source in &workspace.sources {
                for destination in &source.destinations {
                    if let Ok(kind) = destination.destination_definition.name.parse() {
                        enabled.insert(kind);
                    }
                }
            }
        }

        for kind in &enabled {
            match self.routers.get(kind) {
                Some(router) => {
                    debug!(dest_type = %kind, "enabling existing destination router");
                    router.enable();
                }
                None => {
                    info!(dest_type = %kind, "starting a new warehouse destination router");
                    let router = Router::setup(*kind, self.child_deps()).await?;
                    self.routers.insert(*kind, router);
                }
            }
        }

        for (kind, router) in &self.routers {
            if !enabled.contains(kind) {
                info!(dest_type = %kind, "disabling existing destination router");
                router.disable();
            }
        }

        Ok(())
    }

    pub fn router(&self, kind: DestinationKind) -> Option<&Router> {
        self.routers.get(&kind)
    }

    fn child_deps(&self) -> RouterDeps {
        let mut deps = self.deps.clone();
        deps.cancel = self.deps.cancel.child_token();
        deps
    }

    async fn shutdown(self) -> Result<(), SchedulerError> {
        let shutdowns = self
            .routers
            .into_values()
            .map(|router| router.shutdown());
        let mut first_error = None;
        for result in futures::future::join_all(shutdowns).await {
            if let Err(err) = result {
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
