use crate::error::SchedulerError;
use crate::pause::sleep_or_cancelled;
use crate::router::RouterState;
use chrono::{DateTime, Utc};
use model::connection::Connection;
use model::staging::StagingFile;
use model::upload::{NewUpload, UploadMetadata, UploadStatus, TRIGGERED_PRIORITY};
use rand::Rng;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info};

/// Discovers unconsumed staging files per connection and folds them into
/// batched upload jobs, honoring the per-connection sync frequency and
/// manual triggers.
pub struct Creator {
    state: Arc<RouterState>,
}

impl Creator {
    pub fn new(state: Arc<RouterState>) -> Self {
        Self { state }
    }

    pub async fn run(self) -> Result<(), SchedulerError> {
        loop {
            if self.state.cancel.is_cancelled() {
                break;
            }
            if !self.state.is_enabled() {
                if sleep_or_cancelled(&self.state.cancel, self.state.settings.main_loop_sleep).await
                {
                    break;
                }
                continue;
            }

            self.pass().await;

            if sleep_or_cancelled(&self.state.cancel, self.state.settings.main_loop_sleep).await {
                break;
            }
        }
        Ok(())
    }

    /// One pass over every connection of the router, fanned out with bounded
    /// parallelism. Per-connection failures are logged and retried on the
    /// next pass.
    pub async fn pass(&self) {
        let warehouses = self.state.warehouses.read().await.clone();
        let semaphore = Arc::new(Semaphore::new(self.state.settings.max_parallel_job_creation));

        let tasks = warehouses.into_iter().map(|connection| {
            let semaphore = semaphore.clone();
            async move {
                let _permit = semaphore.acquire().await;
                debug!(identifier = %connection.identifier, "processing jobs for warehouse");
                if let Err(err) = self.process_connection(&connection).await {
                    error!(
                        identifier = %connection.identifier,
                        error = %err,
                        "failed to process warehouse jobs"
                    );
                }
            }
        });
        futures::future::join_all(tasks).await;

        self.state.metrics.record_scheduling_pass();
    }

    /// Create upload jobs for one connection; returns how many were
    /// inserted.
    pub async fn process_connection(
        &self,
        connection: &Connection,
    ) -> Result<usize, SchedulerError> {
        let state = &self.state;
        let source_id = connection.source.id.as_str();
        let destination_id = connection.destination.id.as_str();

        // Crashed destinations must be cleaned up by the loader before any
        // new jobs are cut for them.
        if state.context.is_interrupted(destination_id).await {
            info!(
                dest_type = %state.kind,
                destination_id,
                "crash recovering"
            );
            state
                .runner
                .crash_recover(connection)
                .await
                .map_err(|source| SchedulerError::CrashRecovery {
                    destination_id: destination_id.to_string(),
                    source,
                })?;
            state.context.clear_interrupted(destination_id).await;
        }

        let triggered = state.context.is_triggered(&connection.identifier).await;
        let freq_secs = connection
            .sync_frequency_mins()
            .map(|mins| mins * 60)
            .unwrap_or(state.settings.upload_freq_secs);
        if !triggered
            && state
                .context
                .upload_frequency_exceeded(&connection.identifier, freq_secs, Utc::now())
                .await
        {
            debug!(
                identifier = %connection.identifier,
                "skipping upload loop, sync frequency not exceeded"
            );
            return Ok(0);
        }

        // A still-waiting job is superseded by the incoming batch: delete it
        // and carry its priority forward. Serialized against the allocator so
        // a job cannot be claimed and deleted at the same time.
        let mut carried_priority = 0;
        {
            let _enqueue = state.enqueue_lock.lock().await;
            if let Some(latest) = state
                .store
                .latest_job_status(state.kind, source_id, destination_id)
                .await?
            {
                let identifier = state.worker_identifier(connection);
                if latest.status == UploadStatus::Waiting
                    && !state.is_job_in_progress(&identifier, latest.id)
                {
                    state.store.delete_waiting_job(latest.id).await?;
                    carried_priority = latest.priority;
                }
            }
        }

        let latest_end = state
            .store
            .latest_end_staging_file_id(source_id, destination_id)
            .await?;
        let staging_files = state
            .store
            .staging_after(source_id, destination_id, latest_end)
            .await?;

        let start_after = self.upload_start_after();

        if staging_files.is_empty() {
            debug!(identifier = %connection.identifier, "no pending staging files");
            state
                .context
                .set_last_processed(&connection.identifier, start_after)
                .await;
            return Ok(0);
        }

        let mut created = 0usize;
        for chunk in plan_batches(&staging_files, state.settings.staging_files_batch_size) {
            let (Some(first), Some(last)) = (chunk.first(), chunk.last()) else {
                continue;
            };

            let metadata = UploadMetadata {
                use_rudder_storage: first.use_rudder_storage,
                source_batch_id: first.source_batch_id.clone(),
                source_task_id: first.source_task_id.clone(),
                source_task_run_id: first.source_task_run_id.clone(),
                source_job_id: first.source_job_id.clone(),
                source_job_run_id: first.source_job_run_id.clone(),
                load_file_type: Some(state.kind.load_file_type()),
                next_retry_time: Some(start_after),
                priority: if triggered {
                    Some(TRIGGERED_PRIORITY)
                } else if carried_priority != 0 {
                    Some(carried_priority)
                } else {
                    None
                },
            };

            state
                .store
                .insert_job(&NewUpload {
                    source_id: source_id.to_string(),
                    namespace: connection.namespace.clone(),
                    workspace_id: connection.workspace_id.clone(),
                    destination_id: destination_id.to_string(),
                    destination_kind: state.kind,
                    start_staging_file_id: first.id,
                    end_staging_file_id: last.id,
                    first_event_at: first.first_event_at,
                    last_event_at: last.last_event_at,
                    metadata,
                })
                .await?;
            created += 1;
        }

        // Only a consumed trigger is cleared; a crash before the inserts
        // keeps the flag for the next pass.
        if triggered {
            state.context.clear_trigger(&connection.identifier).await;
        }
        state
            .context
            .set_last_processed(&connection.identifier, start_after)
            .await;

        state.metrics.record_jobs_created(created as u64);
        info!(
            identifier = %connection.identifier,
            jobs = created,
            staging_files = staging_files.len(),
            "created upload jobs"
        );
        Ok(created)
    }

    fn upload_start_after(&self) -> DateTime<Utc> {
        if self.state.settings.enable_jitter_for_syncs {
            let jitter = rand::thread_rng().gen_range(0..15);
            Utc::now() + chrono::Duration::seconds(jitter)
        } else {
            Utc::now()
        }
    }
}

/// Split pending staging files into upload batches: contiguous runs with the
/// same storage flavor, each chunked to at most `batch_size` files.
pub fn plan_batches(files: &[StagingFile], batch_size: usize) -> Vec<&[StagingFile]> {
    let batch_size = batch_size.max(1);
    let mut batches = Vec::new();
    let mut start = 0usize;

    for idx in 0..files.len() {
        let storage_flips = idx + 1 < files.len()
            && files[idx + 1].use_rudder_storage != files[idx].use_rudder_storage;
        let full = idx + 1 - start == batch_size;
        let last = idx + 1 == files.len();

        if storage_flips || full || last {
            batches.push(&files[start..=idx]);
            start = idx + 1;
        }
    }
    batches
}
