use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use model::destination::DestinationKind;
use model::staging::StagingFile;
use model::upload::{NewUpload, Upload, UploadStatus};
use std::collections::HashMap;
use std::sync::Mutex;
use store::{ClaimRequest, JobStore, LatestJob, PendingBy, PendingStats, StoreError};

#[derive(Debug, Clone)]
struct StoredNamespace {
    source_id: String,
    destination_id: String,
    namespace: String,
}

#[derive(Debug, Default)]
struct Inner {
    staging: Vec<StagingFile>,
    uploads: Vec<Upload>,
    schemas: Vec<StoredNamespace>,
    next_upload_id: i64,
}

/// In-memory `JobStore` mirroring the Postgres implementation's semantics,
/// including the partitioned claim selection. Keeps the suite hermetic.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_staging_file(&self, file: StagingFile) {
        let mut inner = self.inner.lock().unwrap();
        inner.staging.push(file);
        inner.staging.sort_by_key(|file| file.id);
    }

    pub fn add_staging_files<I>(&self, files: I)
    where
        I: IntoIterator<Item = StagingFile>,
    {
        let mut inner = self.inner.lock().unwrap();
        inner.staging.extend(files);
        inner.staging.sort_by_key(|file| file.id);
    }

    /// Seed a fully formed upload row (id is assigned); for arranging
    /// pre-existing states like in-progress or failed uploads.
    pub fn seed_upload(&self, mut upload: Upload) -> i64 {
        let mut inner = self.inner.lock().unwrap();
        inner.next_upload_id += 1;
        upload.id = inner.next_upload_id;
        let id = upload.id;
        inner.uploads.push(upload);
        id
    }

    pub fn upload(&self, id: i64) -> Option<Upload> {
        let inner = self.inner.lock().unwrap();
        inner.uploads.iter().find(|upload| upload.id == id).cloned()
    }

    pub fn uploads(&self) -> Vec<Upload> {
        let mut uploads = self.inner.lock().unwrap().uploads.clone();
        uploads.sort_by_key(|upload| upload.id);
        uploads
    }

    pub fn set_status(&self, id: i64, status: UploadStatus) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(upload) = inner.uploads.iter_mut().find(|upload| upload.id == id) {
            upload.status = status;
            upload.updated_at = Utc::now();
        }
    }

    pub fn add_stored_namespace(&self, source_id: &str, destination_id: &str, namespace: &str) {
        self.inner.lock().unwrap().schemas.push(StoredNamespace {
            source_id: source_id.to_string(),
            destination_id: destination_id.to_string(),
            namespace: namespace.to_string(),
        });
    }

    fn selectable(upload: &Upload, req: &ClaimRequest, now: DateTime<Utc>) -> bool {
        upload.destination_kind == req.destination_kind
            && !upload.in_progress
            && !upload.status.is_terminal()
            && upload
                .metadata
                .next_retry_time
                .map(|at| at <= now)
                .unwrap_or(true)
            && !req.skipped_workspaces.contains(&upload.workspace_id)
            && !req
                .skipped_partition_keys
                .contains(&upload.partition_key(req.multi_source))
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn latest_end_staging_file_id(
        &self,
        source_id: &str,
        destination_id: &str,
    ) -> Result<i64, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .uploads
            .iter()
            .filter(|u| u.source_id == source_id && u.destination_id == destination_id)
            .map(|u| u.end_staging_file_id)
            .max()
            .unwrap_or(0))
    }

    async fn staging_after(
        &self,
        source_id: &str,
        destination_id: &str,
        after_id: i64,
    ) -> Result<Vec<StagingFile>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .staging
            .iter()
            .filter(|f| {
                f.source_id == source_id && f.destination_id == destination_id && f.id > after_id
            })
            .cloned()
            .collect())
    }

    async fn staging_in_range(
        &self,
        source_id: &str,
        destination_id: &str,
        from_id: i64,
        to_id: i64,
    ) -> Result<Vec<StagingFile>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .staging
            .iter()
            .filter(|f| {
                f.source_id == source_id
                    && f.destination_id == destination_id
                    && f.id >= from_id
                    && f.id <= to_id
            })
            .cloned()
            .collect())
    }

    async fn insert_job(&self, job: &NewUpload) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_upload_id += 1;
        let now = Utc::now();
        let upload = Upload {
            id: inner.next_upload_id,
            source_id: job.source_id.clone(),
            namespace: job.namespace.clone(),
            workspace_id: job.workspace_id.clone(),
            destination_id: job.destination_id.clone(),
            destination_kind: job.destination_kind,
            start_staging_file_id: job.start_staging_file_id,
            end_staging_file_id: job.end_staging_file_id,
            start_load_file_id: 0,
            end_load_file_id: 0,
            status: UploadStatus::Waiting,
            in_progress: false,
            schema: serde_json::json!({}),
            merged_schema: serde_json::json!({}),
            error: serde_json::json!({}),
            metadata: job.metadata.clone(),
            timings: Vec::new(),
            first_event_at: job.first_event_at,
            last_event_at: job.last_event_at,
            priority: job.metadata.priority(),
            attempts: 0,
            created_at: now,
            updated_at: now,
        };
        let id = upload.id;
        inner.uploads.push(upload);
        Ok(id)
    }

    async fn latest_job_status(
        &self,
        kind: DestinationKind,
        source_id: &str,
        destination_id: &str,
    ) -> Result<Option<LatestJob>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .uploads
            .iter()
            .filter(|u| {
                u.destination_kind == kind
                    && u.source_id == source_id
                    && u.destination_id == destination_id
            })
            .max_by_key(|u| u.id)
            .map(|u| LatestJob {
                id: u.id,
                status: u.status,
                priority: u.metadata.priority(),
            }))
    }

    async fn delete_waiting_job(&self, id: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .uploads
            .retain(|u| !(u.id == id && u.status == UploadStatus::Waiting));
        Ok(())
    }

    async fn claim_jobs(&self, req: &ClaimRequest) -> Result<Vec<Upload>, StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.lock().unwrap();

        // First row per partition by (priority, id), then the top rows across
        // partitions by the same key — the window-function selection.
        let mut per_partition: HashMap<String, (i32, i64)> = HashMap::new();
        for upload in inner.uploads.iter() {
            if !Self::selectable(upload, req, now) {
                continue;
            }
            let key = upload.partition_key(req.multi_source);
            let rank = (upload.metadata.priority(), upload.id);
            per_partition
                .entry(key)
                .and_modify(|best| {
                    if rank < *best {
                        *best = rank;
                    }
                })
                .or_insert(rank);
        }

        let mut winners: Vec<(i32, i64)> = per_partition.into_values().collect();
        winners.sort();
        winners.truncate(req.limit);

        let mut claimed = Vec::with_capacity(winners.len());
        for (priority, id) in winners {
            if let Some(upload) = inner.uploads.iter_mut().find(|u| u.id == id) {
                upload.in_progress = true;
                upload.priority = priority;
                upload.updated_at = now;
                claimed.push(upload.clone());
            }
        }
        Ok(claimed)
    }

    async fn pending_stats(&self, req: &ClaimRequest) -> Result<PendingStats, StoreError> {
        let now = Utc::now();
        let inner = self.inner.lock().unwrap();

        let mut stats = PendingStats::default();
        let mut oldest: Option<DateTime<Utc>> = None;
        for upload in inner.uploads.iter() {
            if !Self::selectable(upload, req, now) {
                continue;
            }
            stats.pending_jobs += 1;
            let retry_at = upload.metadata.next_retry_time.unwrap_or(now);
            stats.pickup_wait_seconds += (now - retry_at).num_seconds() as f64;
            oldest = Some(match oldest {
                Some(existing) => existing.min(retry_at),
                None => retry_at,
            });
        }
        if let Some(oldest) = oldest {
            stats.pickup_lag_seconds = (now - oldest).num_seconds().max(0) as f64;
        }
        Ok(stats)
    }

    async fn reset_in_progress(&self, kind: DestinationKind) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        for upload in inner.uploads.iter_mut() {
            if upload.destination_kind == kind {
                upload.in_progress = false;
            }
        }
        Ok(())
    }

    async fn interrupted_destinations(
        &self,
        kind: DestinationKind,
    ) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut destinations: Vec<String> = inner
            .uploads
            .iter()
            .filter(|u| {
                u.destination_kind == kind
                    && u.in_progress
                    && matches!(
                        u.status,
                        UploadStatus::ExportingData | UploadStatus::ExportingDataFailed
                    )
            })
            .map(|u| u.destination_id.clone())
            .collect();
        destinations.sort();
        destinations.dedup();
        Ok(destinations)
    }

    async fn set_in_progress(&self, id: i64, in_progress: bool) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(upload) = inner.uploads.iter_mut().find(|u| u.id == id) {
            upload.in_progress = in_progress;
            upload.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn abort_job(&self, id: i64, reason: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(upload) = inner.uploads.iter_mut().find(|u| u.id == id) {
            upload.status = UploadStatus::Aborted;
            upload.in_progress = false;
            upload.error = serde_json::json!({
                "scheduler": { "errors": [reason], "attempt": 1 }
            });
            upload.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn pending_staging_file_count(&self, by: &PendingBy) -> Result<i64, StoreError> {
        let inner = self.inner.lock().unwrap();
        let matches_upload = |u: &&Upload| match by {
            PendingBy::Source(id) => u.source_id == *id,
            PendingBy::Destination(id) => u.destination_id == *id,
        };
        let matches_staging = |f: &&StagingFile| match by {
            PendingBy::Source(id) => f.source_id == *id,
            PendingBy::Destination(id) => f.destination_id == *id,
        };

        let last_covered = inner
            .uploads
            .iter()
            .filter(matches_upload)
            .map(|u| u.end_staging_file_id)
            .max()
            .unwrap_or(0);
        Ok(inner
            .staging
            .iter()
            .filter(matches_staging)
            .filter(|f| f.id > last_covered)
            .count() as i64)
    }

    async fn pending_upload_count(
        &self,
        source_id: &str,
        source_task_run_id: Option<&str>,
    ) -> Result<i64, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .uploads
            .iter()
            .filter(|u| u.source_id == source_id && !u.status.is_terminal())
            .filter(|u| match source_task_run_id {
                Some(task_run_id) => u.metadata.source_task_run_id.as_deref() == Some(task_run_id),
                None => true,
            })
            .count() as i64)
    }

    async fn latest_staging_created_in_window(
        &self,
        source_id: &str,
        destination_id: &str,
        window_mins: i64,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let now = Utc::now();
        let newest = now - Duration::minutes(window_mins);
        let oldest = now - Duration::minutes(2 * window_mins);
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .staging
            .iter()
            .filter(|f| {
                f.source_id == source_id
                    && f.destination_id == destination_id
                    && f.created_at > oldest
                    && f.created_at < newest
            })
            .map(|f| f.created_at)
            .max())
    }

    async fn terminal_upload_exists_since(
        &self,
        source_id: &str,
        destination_id: &str,
        since: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.uploads.iter().any(|u| {
            u.source_id == source_id
                && u.destination_id == destination_id
                && (u.status.is_terminal() || u.status.as_str().ends_with("_failed"))
                && u.updated_at > since
        }))
    }

    async fn stored_namespace(
        &self,
        source_id: &str,
        destination_id: &str,
    ) -> Result<Option<String>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .schemas
            .iter()
            .rev()
            .find(|s| s.source_id == source_id && s.destination_id == destination_id)
            .map(|s| s.namespace.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{staging_file, upload_row};
    use chrono::Duration;

    const KIND: DestinationKind = DestinationKind::Postgres;

    fn request() -> ClaimRequest {
        ClaimRequest {
            destination_kind: KIND,
            limit: 8,
            skipped_workspaces: Vec::new(),
            skipped_partition_keys: Vec::new(),
            multi_source: false,
        }
    }

    // Jobs with a nextRetryTime in the future stay out of claim results
    // until the clock catches up.
    #[tokio::test]
    async fn claim_honors_next_retry_time() {
        let store = MemoryStore::new();
        store.seed_upload({
            let mut row = upload_row("s", "d", "ns", KIND, (1, 5), UploadStatus::Waiting, None);
            row.metadata.next_retry_time = Some(Utc::now() + Duration::minutes(10));
            row
        });
        let due = store.seed_upload({
            let mut row = upload_row("s2", "d2", "ns", KIND, (1, 5), UploadStatus::Waiting, None);
            row.metadata.next_retry_time = Some(Utc::now() - Duration::minutes(1));
            row
        });

        let claimed = store.claim_jobs(&request()).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, due);
    }

    // The latest-pointer is MAX(end_staging_file_id), not the newest row.
    #[tokio::test]
    async fn latest_end_pointer_is_a_max() {
        let store = MemoryStore::new();
        store.seed_upload(upload_row(
            "s",
            "d",
            "ns",
            KIND,
            (1, 100),
            UploadStatus::ExportedData,
            None,
        ));
        store.seed_upload(upload_row(
            "s",
            "d",
            "ns",
            KIND,
            (101, 90_000),
            UploadStatus::ExportedData,
            None,
        ));
        store.seed_upload(upload_row(
            "s",
            "d",
            "ns",
            KIND,
            (200, 300),
            UploadStatus::ExportedData,
            None,
        ));

        assert_eq!(store.latest_end_staging_file_id("s", "d").await.unwrap(), 90_000);
        assert_eq!(store.latest_end_staging_file_id("s", "other").await.unwrap(), 0);
    }

    // Pending counts: staging files beyond the covered range, and
    // non-terminal uploads per source.
    #[tokio::test]
    async fn pending_counts() {
        let store = MemoryStore::new();
        store.add_staging_files((1..=30).map(|id| staging_file(id, "s", "d", true)));
        store.seed_upload(upload_row(
            "s",
            "d",
            "ns",
            KIND,
            (1, 20),
            UploadStatus::ExportedData,
            None,
        ));
        store.seed_upload(upload_row(
            "s",
            "d",
            "ns",
            KIND,
            (21, 25),
            UploadStatus::Waiting,
            None,
        ));

        assert_eq!(
            store
                .pending_staging_file_count(&PendingBy::Source("s".into()))
                .await
                .unwrap(),
            5
        );
        assert_eq!(
            store
                .pending_staging_file_count(&PendingBy::Destination("d".into()))
                .await
                .unwrap(),
            5
        );
        assert_eq!(store.pending_upload_count("s", None).await.unwrap(), 1);
        assert_eq!(store.pending_upload_count("s", Some("tr-1")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn pending_stats_counts_every_selectable_row() {
        let store = MemoryStore::new();
        for source in ["s1", "s2", "s3"] {
            store.seed_upload(upload_row(
                source,
                "d",
                source,
                KIND,
                (1, 5),
                UploadStatus::Waiting,
                None,
            ));
        }

        let stats = store.pending_stats(&request()).await.unwrap();
        assert_eq!(stats.pending_jobs, 3);

        store.claim_jobs(&request()).await.unwrap();
        let stats = store.pending_stats(&request()).await.unwrap();
        assert_eq!(stats.pending_jobs, 0);
    }
}
