use crate::error::SchedulerError;
use crate::pause::sleep_or_cancelled;
use crate::router::RouterState;
use std::sync::Arc;
use tracing::{debug, warn};

/// Default sync window (minutes) assumed for connections without an explicit
/// `syncFrequency`.
const DEFAULT_SYNC_WINDOW_MINS: i64 = 1440;

/// Observability loop: per connection, checks whether staging files that
/// landed a sync window ago have produced a terminal or failed upload, and
/// records the hit or miss. Scheduling never depends on it.
pub struct Tracker {
    state: Arc<RouterState>,
}

impl Tracker {
    pub fn new(state: Arc<RouterState>) -> Self {
        Self { state }
    }

    pub async fn run(self) -> Result<(), SchedulerError> {
        loop {
            self.pass().await;
            if sleep_or_cancelled(
                &self.state.cancel,
                self.state.settings.upload_status_track_frequency,
            )
            .await
            {
                return Ok(());
            }
        }
    }

    pub async fn pass(&self) {
        let warehouses = self.state.warehouses.read().await.clone();
        for connection in warehouses {
            if !connection.source.enabled || !connection.destination.enabled {
                continue;
            }
            if let Err(err) = self.track_connection(&connection).await {
                debug!(
                    identifier = %connection.identifier,
                    error = %err,
                    "upload status tracking failed"
                );
            }
        }
    }

    async fn track_connection(
        &self,
        connection: &model::connection::Connection,
    ) -> Result<(), SchedulerError> {
        let state = &self.state;
        let sync_window = connection
            .sync_frequency_mins()
            .unwrap_or(DEFAULT_SYNC_WINDOW_MINS);
        let window_mins = state.settings.upload_buffer_time_mins + sync_window;

        let created_at = state
            .store
            .latest_staging_created_in_window(
                &connection.source.id,
                &connection.destination.id,
                window_mins,
            )
            .await?;
        let Some(created_at) = created_at else {
            return Ok(());
        };

        let uploaded = state
            .store
            .terminal_upload_exists_since(
                &connection.source.id,
                &connection.destination.id,
                created_at,
            )
            .await?;

        state.metrics.record_tracked_upload(uploaded);
        if !uploaded {
            warn!(
                identifier = %connection.identifier,
                staged_at = %created_at,
                "staging files past their sync window have no upload yet"
            );
        }
        Ok(())
    }
}
