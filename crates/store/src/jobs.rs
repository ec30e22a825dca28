use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use model::destination::DestinationKind;
use model::staging::StagingFile;
use model::upload::{NewUpload, Upload, UploadStatus};

/// Inputs of one allocator claim pass.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub destination_kind: DestinationKind,
    /// Number of free workers; at most this many rows come back.
    pub limit: usize,
    /// Workspaces currently excluded by the degraded-tenant oracle.
    pub skipped_workspaces: Vec<String>,
    /// Partition keys whose in-flight quota is already full.
    pub skipped_partition_keys: Vec<String>,
    /// Partition by (source, destination, namespace) instead of
    /// (destination, namespace).
    pub multi_source: bool,
}

/// Pickup backlog figures, reported after every claim pass.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PendingStats {
    pub pending_jobs: i64,
    pub pickup_lag_seconds: f64,
    pub pickup_wait_seconds: f64,
}

/// The newest upload row of a connection.
#[derive(Debug, Clone)]
pub struct LatestJob {
    pub id: i64,
    pub status: UploadStatus,
    pub priority: i32,
}

/// Which side of a connection a pending-count query filters on.
#[derive(Debug, Clone)]
pub enum PendingBy {
    Source(String),
    Destination(String),
}

/// Persistence seam of the scheduler: upload jobs, staging-file ranges and
/// the schema catalog. `PgStore` is the production implementation; tests run
/// against an in-memory one.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Highest staging-file id already covered by any upload of the pair;
    /// 0 when the pair has no uploads yet.
    async fn latest_end_staging_file_id(
        &self,
        source_id: &str,
        destination_id: &str,
    ) -> Result<i64, StoreError>;

    /// Staging files with id greater than `after_id`, ordered by id.
    async fn staging_after(
        &self,
        source_id: &str,
        destination_id: &str,
        after_id: i64,
    ) -> Result<Vec<StagingFile>, StoreError>;

    /// Staging files with `from_id <= id <= to_id`, ordered by id.
    async fn staging_in_range(
        &self,
        source_id: &str,
        destination_id: &str,
        from_id: i64,
        to_id: i64,
    ) -> Result<Vec<StagingFile>, StoreError>;

    /// Insert a fresh `waiting` upload; returns the new row id.
    async fn insert_job(&self, job: &NewUpload) -> Result<i64, StoreError>;

    async fn latest_job_status(
        &self,
        kind: DestinationKind,
        source_id: &str,
        destination_id: &str,
    ) -> Result<Option<LatestJob>, StoreError>;

    /// Delete the row only if it is still `waiting`.
    async fn delete_waiting_job(&self, id: i64) -> Result<(), StoreError>;

    /// Select the next claimable upload per partition under the request's
    /// exclusions, mark every returned row `in_progress`, and return them
    /// ordered by (priority asc, id asc). Relies on the single-writer
    /// invariant: one allocator per destination kind per process.
    async fn claim_jobs(&self, req: &ClaimRequest) -> Result<Vec<Upload>, StoreError>;

    /// Backlog counters for the same filter claim_jobs uses.
    async fn pending_stats(&self, req: &ClaimRequest) -> Result<PendingStats, StoreError>;

    /// Clear every lingering `in_progress` flag of the kind. Boot-time only,
    /// before the allocator starts.
    async fn reset_in_progress(&self, kind: DestinationKind) -> Result<(), StoreError>;

    /// Destinations whose export was cut short by a crash: rows still flagged
    /// in-progress in `exporting_data` or `exporting_data_failed`.
    async fn interrupted_destinations(
        &self,
        kind: DestinationKind,
    ) -> Result<Vec<String>, StoreError>;

    async fn set_in_progress(&self, id: i64, in_progress: bool) -> Result<(), StoreError>;

    /// Terminally abort one upload, recording the reason in the error blob.
    async fn abort_job(&self, id: i64, reason: &str) -> Result<(), StoreError>;

    /// Staging files not yet covered by any upload of the given source or
    /// destination.
    async fn pending_staging_file_count(&self, by: &PendingBy) -> Result<i64, StoreError>;

    /// Non-terminal uploads of a source, optionally narrowed to one task run.
    async fn pending_upload_count(
        &self,
        source_id: &str,
        source_task_run_id: Option<&str>,
    ) -> Result<i64, StoreError>;

    /// Newest staging file of the pair created inside
    /// `(now - 2*window, now - window)`; the status tracker's probe window.
    async fn latest_staging_created_in_window(
        &self,
        source_id: &str,
        destination_id: &str,
        window_mins: i64,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Whether the pair produced a terminal or failed upload after `since`.
    async fn terminal_upload_exists_since(
        &self,
        source_id: &str,
        destination_id: &str,
        since: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Namespace previously recorded in the schema catalog for the pair.
    async fn stored_namespace(
        &self,
        source_id: &str,
        destination_id: &str,
    ) -> Result<Option<String>, StoreError>;
}
