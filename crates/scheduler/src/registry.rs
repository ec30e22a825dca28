use crate::error::SchedulerError;
use crate::router::RouterState;
use crate::workers;
use async_trait::async_trait;
use model::config::{ControlPlaneSnapshot, Destination, Source};
use model::connection::Connection;
use model::destination::DestinationKind;
use model::namespace::{to_provider_case, to_safe_namespace};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Resolves SSH tunnel private keys for destinations that enable
/// tunnelling. Key storage lives in the control plane, outside this crate.
#[async_trait]
pub trait SshKeyResolver: Send + Sync {
    async fn private_key(
        &self,
        destination_id: &str,
    ) -> Result<String, Box<dyn std::error::Error + Send + Sync>>;
}

/// Per-router config subscriber: applies every control-plane snapshot to the
/// router's connection list, derives namespaces, and lazily creates worker
/// pools.
pub struct Registry {
    state: Arc<RouterState>,
}

impl Registry {
    pub fn new(state: Arc<RouterState>) -> Self {
        Self { state }
    }

    pub async fn run(self) -> Result<(), SchedulerError> {
        let mut rx = self.state.tenant.watch_config();

        // A router may come up after the first push; apply whatever is
        // already there.
        let current = rx.borrow_and_update().clone();
        if !current.is_empty() {
            self.apply_snapshot(&current).await;
        }

        loop {
            tokio::select! {
                _ = self.state.cancel.cancelled() => break,
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let snapshot = rx.borrow_and_update().clone();
                    self.apply_snapshot(&snapshot).await;
                }
            }
        }
        Ok(())
    }

    /// Rebuild the router's warehouse list from one snapshot. Runs under a
    /// single exclusive acquisition of the connection-list lock so readers
    /// never observe a half-applied snapshot.
    pub async fn apply_snapshot(&self, snapshot: &ControlPlaneSnapshot) {
        let state = &self.state;
        info!(dest_type = %state.kind, "received updated workspace config");

        let mut warehouses = state.warehouses.write().await;
        warehouses.clear();
        state.context.clear_workspace_sources().await;

        for (workspace_id, workspace) in snapshot {
            for source in &workspace.sources {
                state
                    .context
                    .record_workspace_source(workspace_id, &source.id)
                    .await;

                for destination in &source.destinations {
                    if destination.destination_definition.name != state.kind.as_str() {
                        continue;
                    }

                    let destination = self.attach_ssh_tunnelling(destination).await;
                    let namespace = self.namespace(source, &destination).await;
                    let connection = Connection::new(
                        workspace_id.clone(),
                        source.clone(),
                        destination,
                        namespace,
                        state.kind,
                    );

                    warehouses.push(connection.clone());
                    workers::ensure_worker(state, &state.worker_identifier(&connection)).await;

                    if connection.destination.config_str("sslMode") == Some("verify-ca") {
                        if let Err(reason) = verify_ssl_material(&connection.destination) {
                            error!(
                                dest_type = %state.kind,
                                destination_id = %connection.destination.id,
                                reason,
                                "cannot persist ssl material"
                            );
                            state.metrics.record_ssl_persist_failure();
                        }
                    }

                    state.context.upsert_connection(connection).await;
                }
            }
        }

        debug!(
            dest_type = %state.kind,
            warehouses = warehouses.len(),
            "releasing config subscriber lock"
        );
        drop(warehouses);
        state.initial_config_fetched.store(true, Ordering::SeqCst);
    }

    /// With tunnelling enabled, swap in a deep copy of the destination
    /// carrying the private key, so the shared upstream record never holds
    /// SSH material. Any failure falls back to the upstream destination.
    async fn attach_ssh_tunnelling(&self, upstream: &Destination) -> Destination {
        if !upstream.config_bool("useSSH") {
            return upstream.clone();
        }

        let Some(resolver) = &self.state.ssh_keys else {
            warn!(
                destination_id = %upstream.id,
                "destination wants ssh tunnelling but no key resolver is wired"
            );
            return upstream.clone();
        };

        debug!(destination_id = %upstream.id, "fetching ssh keys");
        let key = match resolver.private_key(&upstream.id).await {
            Ok(key) => key,
            Err(err) => {
                error!(destination_id = %upstream.id, error = %err, "fetching ssh keys failed");
                return upstream.clone();
            }
        };

        match deep_copy(upstream) {
            Ok(mut replica) => {
                replica
                    .config
                    .insert("sshPrivateKey".to_string(), serde_json::Value::String(key));
                replica
            }
            Err(err) => {
                error!(destination_id = %upstream.id, error = %err, "deep copying the destination failed");
                upstream.clone()
            }
        }
    }

    /// Namespace resolution order: explicit config, per-kind dataset prefix,
    /// previously recorded namespace, sanitized source name. Clickhouse names
    /// the database directly.
    async fn namespace(&self, source: &Source, destination: &Destination) -> String {
        let state = &self.state;
        let kind = state.kind;

        if kind == DestinationKind::Clickhouse {
            if let Some(database) = destination.config_str("database") {
                return database.to_string();
            }
            warn!(
                destination_id = %destination.id,
                "clickhouse destination has no database configured, deriving a namespace"
            );
        }

        if let Some(namespace) = destination.config_str("namespace") {
            let trimmed = namespace.trim();
            if !trimmed.is_empty() {
                return to_provider_case(kind, &to_safe_namespace(kind, trimmed));
            }
        }

        if let Some(prefix) = &state.router_settings.custom_dataset_prefix {
            return to_safe_namespace(kind, &format!("{}_{}", prefix, source.name));
        }

        match state
            .store
            .stored_namespace(&source.id, &destination.id)
            .await
        {
            Ok(Some(namespace)) => return namespace,
            Ok(None) => {}
            Err(err) => {
                error!(
                    source_id = %source.id,
                    destination_id = %destination.id,
                    error = %err,
                    "schema catalog lookup failed, deriving namespace from source name"
                );
            }
        }

        to_safe_namespace(kind, &source.name)
    }
}

fn deep_copy(destination: &Destination) -> Result<Destination, serde_json::Error> {
    serde_json::from_value(serde_json::to_value(destination)?)
}

/// The loaders expect client key, client cert and server CA when a
/// destination pins `verify-ca`; flag configs that cannot satisfy that.
fn verify_ssl_material(destination: &Destination) -> Result<(), &'static str> {
    for key in ["clientKey", "clientCert", "serverCA"] {
        match destination.config_str(key) {
            Some(value) if !value.is_empty() => {}
            _ => return Err("missing ssl material in destination config"),
        }
    }
    Ok(())
}
