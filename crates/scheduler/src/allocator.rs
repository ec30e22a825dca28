use crate::error::SchedulerError;
use crate::pause::sleep_or_cancelled;
use crate::router::RouterState;
use crate::runner::PickedUpload;
use model::upload::Upload;
use std::sync::Arc;
use store::{ClaimRequest, StoreError};
use tracing::{debug, error, warn};

/// Selects ready uploads under partition exclusion, fairness and priority
/// rules, marks them in progress and feeds them to the worker pools.
pub struct Allocator {
    state: Arc<RouterState>,
}

impl Allocator {
    pub fn new(state: Arc<RouterState>) -> Self {
        Self { state }
    }

    pub async fn run(self) -> Result<(), SchedulerError> {
        let result = self.run_loop().await;
        // Workers learn about shutdown from their channels closing, after the
        // allocator has stopped feeding them.
        self.state.close_worker_channels().await;
        result
    }

    async fn run_loop(&self) -> Result<(), SchedulerError> {
        let state = &self.state;
        loop {
            if state.cancel.is_cancelled() {
                return Ok(());
            }
            if !state.initial_config_fetched() {
                if sleep_or_cancelled(&state.cancel, state.settings.wait_for_config).await {
                    return Ok(());
                }
                continue;
            }

            let available = state
                .router_settings
                .no_of_workers
                .saturating_sub(state.active_worker_count());
            if available < 1 {
                if sleep_or_cancelled(&state.cancel, state.settings.wait_for_worker_sleep).await {
                    return Ok(());
                }
                continue;
            }

            let picked = self.tick(available).await?;
            for job in picked {
                self.deliver(job).await;
            }

            if sleep_or_cancelled(&state.cancel, state.settings.upload_allocator_sleep).await {
                return Ok(());
            }
        }
    }

    /// One claim pass: under the enqueue lock, claim up to `limit` uploads,
    /// hydrate them and record ownership in the in-progress index. A store
    /// failure here is fatal — the allocator is the single writer for its
    /// destination kind and must not guess.
    pub async fn tick(&self, limit: usize) -> Result<Vec<PickedUpload>, SchedulerError> {
        let state = &self.state;

        let request = ClaimRequest {
            destination_kind: state.kind,
            limit,
            skipped_workspaces: state.tenant.degraded_workspaces().await,
            skipped_partition_keys: state.saturated_partitions(),
            multi_source: state.multi_source(),
        };
        debug!(
            dest_type = %state.kind,
            skipped = ?request.skipped_partition_keys,
            "in-progress partition identifiers"
        );

        let picked = {
            let _enqueue = state.enqueue_lock.lock().await;

            let claimed = match state.store.claim_jobs(&request).await {
                Ok(claimed) => claimed,
                Err(err) => {
                    error!(dest_type = %state.kind, error = %err, "claiming uploads failed");
                    state.cancel.cancel();
                    return Err(SchedulerError::ClaimFailed(err));
                }
            };

            let mut picked = Vec::with_capacity(claimed.len());
            for upload in claimed {
                match self.hydrate(upload).await {
                    Ok(Some(job)) => picked.push(job),
                    Ok(None) => {}
                    Err(err) => {
                        error!(dest_type = %state.kind, error = %err, "hydrating claimed upload failed");
                        state.cancel.cancel();
                        return Err(SchedulerError::ClaimFailed(err));
                    }
                }
            }

            for job in &picked {
                let identifier = state.worker_identifier(&job.connection);
                state.add_in_progress(&identifier, job.upload.id);
            }
            picked
        };

        state.metrics.record_jobs_claimed(picked.len() as u64);

        match state.store.pending_stats(&request).await {
            Ok(stats) => state.metrics.record_pending(stats, limit),
            Err(err) => debug!(dest_type = %state.kind, error = %err, "pending stats query failed"),
        }

        Ok(picked)
    }

    /// Attach staging files and the live connection to a claimed row. A row
    /// whose connection no longer exists is aborted on the spot.
    async fn hydrate(&self, mut upload: Upload) -> Result<Option<PickedUpload>, StoreError> {
        let state = &self.state;

        if upload.workspace_id.is_empty() {
            match state.context.workspace_for_source(&upload.source_id).await {
                Some(workspace_id) => upload.workspace_id = workspace_id,
                None => {
                    warn!(
                        source_id = %upload.source_id,
                        "could not find workspace id for source id"
                    );
                }
            }
        }

        let connection = state
            .context
            .connection(&upload.destination_id, &upload.source_id)
            .await;
        let Some(connection) = connection else {
            let reason = format!(
                "unable to find source : {} or destination : {}, both or the connection between them",
                upload.source_id, upload.destination_id
            );
            error!(dest_type = %state.kind, upload_id = upload.id, "{reason}");
            state.store.abort_job(upload.id, &reason).await?;
            state.metrics.record_job_aborted();
            return Ok(None);
        };

        let staging_files = state
            .store
            .staging_in_range(
                &upload.source_id,
                &upload.destination_id,
                upload.start_staging_file_id,
                upload.end_staging_file_id,
            )
            .await?;

        Ok(Some(PickedUpload {
            upload,
            staging_files,
            connection,
        }))
    }

    /// Hand one job to its worker pool. The send blocks on a full channel so
    /// backpressure reaches the allocator; no scheduler lock is held here.
    async fn deliver(&self, job: PickedUpload) {
        let state = &self.state;
        let identifier = state.worker_identifier(&job.connection);
        let job_id = job.upload.id;

        let sender = {
            let channels = state.worker_channels.read().await;
            channels.get(&identifier).cloned()
        };

        let delivered = match sender {
            Some(sender) => sender.send(job).await.is_ok(),
            None => {
                warn!(
                    dest_type = %state.kind,
                    identifier = %identifier,
                    "no worker pool for identifier"
                );
                false
            }
        };

        if !delivered {
            // Shutdown raced the send; give the job back so the boot-time
            // reset or a later claim picks it up.
            state.remove_in_progress(&identifier, job_id);
            if let Err(err) = state.store.set_in_progress(job_id, false).await {
                error!(
                    dest_type = %state.kind,
                    upload_id = job_id,
                    error = %err,
                    "failed to release undelivered upload"
                );
            }
        }
    }
}
