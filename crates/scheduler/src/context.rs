use chrono::{DateTime, Utc};
use model::connection::Connection;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::info;

/// Process-wide scheduler state shared by every router: the live connection
/// map, manual upload triggers, per-connection frequency markers, the
/// workspace/source correspondences and the crash-recovery backlog.
///
/// Each map sits behind its own lock; nothing here is held across store or
/// runner calls.
#[derive(Debug, Default)]
pub struct SchedulerContext {
    /// destinationId -> sourceId -> connection.
    connections: RwLock<HashMap<String, HashMap<String, Connection>>>,
    /// Connection identifiers flagged for a one-shot manual upload.
    triggers: RwLock<HashSet<String>>,
    /// Connection identifier -> unix seconds of the last creation attempt.
    last_processed: RwLock<HashMap<String, i64>>,
    source_ids_by_workspace: RwLock<HashMap<String, Vec<String>>>,
    workspace_by_source: RwLock<HashMap<String, String>>,
    /// Destinations with uploads interrupted by a crash, drained lazily by
    /// the creator.
    interrupted: RwLock<HashSet<String>>,
}

impl SchedulerContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upsert_connection(&self, connection: Connection) {
        let mut connections = self.connections.write().await;
        connections
            .entry(connection.destination.id.clone())
            .or_default()
            .insert(connection.source.id.clone(), connection);
    }

    pub async fn connection(&self, destination_id: &str, source_id: &str) -> Option<Connection> {
        let connections = self.connections.read().await;
        connections
            .get(destination_id)
            .and_then(|sources| sources.get(source_id))
            .cloned()
    }

    pub async fn record_workspace_source(&self, workspace_id: &str, source_id: &str) {
        self.source_ids_by_workspace
            .write()
            .await
            .entry(workspace_id.to_string())
            .or_default()
            .push(source_id.to_string());
        self.workspace_by_source
            .write()
            .await
            .insert(source_id.to_string(), workspace_id.to_string());
    }

    pub async fn clear_workspace_sources(&self) {
        self.source_ids_by_workspace.write().await.clear();
        self.workspace_by_source.write().await.clear();
    }

    pub async fn workspace_for_source(&self, source_id: &str) -> Option<String> {
        self.workspace_by_source.read().await.get(source_id).cloned()
    }

    pub async fn source_ids(&self, workspace_id: &str) -> Vec<String> {
        self.source_ids_by_workspace
            .read()
            .await
            .get(workspace_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Flag one connection for a manual upload; the creator consumes the flag
    /// only after the jobs are inserted.
    pub async fn trigger_upload(&self, connection: &Connection) {
        self.triggers
            .write()
            .await
            .insert(connection.identifier.clone());
        info!(identifier = %connection.identifier, "upload triggered");
    }

    /// Flag every connection of a source. Returns how many were flagged.
    pub async fn trigger_uploads_for_source(&self, source_id: &str) -> usize {
        let matches: Vec<Connection> = {
            let connections = self.connections.read().await;
            connections
                .values()
                .filter_map(|sources| sources.get(source_id))
                .cloned()
                .collect()
        };
        for connection in &matches {
            self.trigger_upload(connection).await;
        }
        matches.len()
    }

    /// Flag every connection of a destination. Returns how many were flagged.
    pub async fn trigger_uploads_for_destination(&self, destination_id: &str) -> usize {
        let matches: Vec<Connection> = {
            let connections = self.connections.read().await;
            connections
                .get(destination_id)
                .map(|sources| sources.values().cloned().collect())
                .unwrap_or_default()
        };
        for connection in &matches {
            self.trigger_upload(connection).await;
        }
        matches.len()
    }

    pub async fn is_triggered(&self, identifier: &str) -> bool {
        self.triggers.read().await.contains(identifier)
    }

    pub async fn clear_trigger(&self, identifier: &str) {
        self.triggers.write().await.remove(identifier);
    }

    pub async fn set_last_processed(&self, identifier: &str, at: DateTime<Utc>) {
        self.last_processed
            .write()
            .await
            .insert(identifier.to_string(), at.timestamp());
    }

    /// True while the connection is inside its sync interval: the last
    /// creation attempt was less than `freq_secs` ago.
    pub async fn upload_frequency_exceeded(
        &self,
        identifier: &str,
        freq_secs: i64,
        now: DateTime<Utc>,
    ) -> bool {
        let last_processed = self.last_processed.read().await;
        match last_processed.get(identifier) {
            Some(last) => now.timestamp() - last < freq_secs,
            None => false,
        }
    }

    pub async fn mark_interrupted<I>(&self, destination_ids: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.interrupted.write().await.extend(destination_ids);
    }

    pub async fn is_interrupted(&self, destination_id: &str) -> bool {
        self.interrupted.read().await.contains(destination_id)
    }

    pub async fn clear_interrupted(&self, destination_id: &str) {
        self.interrupted.write().await.remove(destination_id);
    }
}
