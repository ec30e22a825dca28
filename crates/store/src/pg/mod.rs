use crate::error::StoreError;
use crate::jobs::{ClaimRequest, JobStore, LatestJob, PendingBy, PendingStats};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use model::destination::DestinationKind;
use model::staging::StagingFile;
use model::upload::{NewUpload, Timing, Upload, UploadMetadata, UploadStatus};
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use std::sync::Arc;
use tokio_postgres::config::SslMode;
use tokio_postgres::{Client, Config, NoTls, Row};
use tracing::{error, warn};

const SCHEMA_SQL: &str = include_str!("sql/schema.sql");
const LATEST_END_STAGING_FILE_ID_SQL: &str = include_str!("sql/latest_end_staging_file_id.sql");
const STAGING_AFTER_SQL: &str = include_str!("sql/staging_after.sql");
const STAGING_IN_RANGE_SQL: &str = include_str!("sql/staging_in_range.sql");
const INSERT_UPLOAD_SQL: &str = include_str!("sql/insert_upload.sql");
const LATEST_JOB_STATUS_SQL: &str = include_str!("sql/latest_job_status.sql");
const DELETE_WAITING_SQL: &str = include_str!("sql/delete_waiting.sql");
const RESET_IN_PROGRESS_SQL: &str = include_str!("sql/reset_in_progress.sql");
const INTERRUPTED_DESTINATIONS_SQL: &str = include_str!("sql/interrupted_destinations.sql");
const SET_IN_PROGRESS_SQL: &str = include_str!("sql/set_in_progress.sql");
const ABORT_UPLOAD_SQL: &str = include_str!("sql/abort_upload.sql");
const STORED_NAMESPACE_SQL: &str = include_str!("sql/stored_namespace.sql");
const STAGING_CREATED_WINDOW_SQL: &str = include_str!("sql/staging_created_window.sql");
const TERMINAL_UPLOAD_EXISTS_SQL: &str = include_str!("sql/terminal_upload_exists.sql");

/// Postgres-backed job store; the control tables live in the same database
/// the upstream producers write staging-file rows to.
#[derive(Clone)]
pub struct PgStore {
    client: Arc<Client>,
}

impl PgStore {
    pub fn new(client: Client) -> Self {
        Self {
            client: Arc::new(client),
        }
    }

    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let config = url
            .parse::<Config>()
            .map_err(|e| StoreError::InvalidUrl(e.to_string()))?;

        let client = match config.get_ssl_mode() {
            SslMode::Disable => connect_without_tls(config).await?,
            SslMode::Prefer => match connect_with_tls(config.clone()).await {
                Ok(client) => client,
                Err(err) => {
                    warn!(error = %err, "postgres TLS handshake failed, retrying without TLS");
                    connect_without_tls(config).await?
                }
            },
            _ => connect_with_tls(config).await?,
        };

        Ok(Self::new(client))
    }

    /// Idempotent bootstrap of the control tables and pickup indexes.
    pub async fn setup_schema(&self) -> Result<(), StoreError> {
        self.client.batch_execute(SCHEMA_SQL).await?;
        Ok(())
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        self.client.query_one("SELECT 1", &[]).await?;
        Ok(())
    }

    fn claim_select_sql(req: &ClaimRequest) -> String {
        let partition_sql = if req.multi_source {
            "source_id, destination_id, namespace"
        } else {
            "destination_id, namespace"
        };
        let partition_key_sql = if req.multi_source {
            "source_id || '_' || destination_id || '_' || namespace"
        } else {
            "destination_id || '_' || namespace"
        };

        format!(
            r#"
            SELECT
                id, status, schema, mergedschema, namespace, workspace_id,
                source_id, destination_id, destination_type,
                start_staging_file_id, end_staging_file_id,
                start_load_file_id, end_load_file_id, error, metadata,
                timings, COALESCE(metadata->>'priority', '100')::int,
                first_event_at, last_event_at, created_at, updated_at
            FROM (
                SELECT
                    ROW_NUMBER() OVER (
                        PARTITION BY {partition_sql}
                        ORDER BY COALESCE(metadata->>'priority', '100')::int ASC, id ASC
                    ) AS row_number,
                    t.*
                FROM wh_uploads t
                WHERE
                    t.destination_type = $3
                    AND t.in_progress = FALSE
                    AND t.status != 'exported_data'
                    AND t.status != 'aborted'
                    AND COALESCE(metadata->>'nextRetryTime', NOW()::text)::timestamptz <= NOW()
                    AND workspace_id <> ALL ($1)
                    AND (({partition_key_sql}) != ALL ($2))
            ) grouped_uploads
            WHERE grouped_uploads.row_number = 1
            ORDER BY COALESCE(metadata->>'priority', '100')::int ASC, id ASC
            LIMIT {limit}
            "#,
            partition_sql = partition_sql,
            partition_key_sql = partition_key_sql,
            limit = req.limit,
        )
    }

    fn pending_stats_sql(req: &ClaimRequest) -> String {
        let partition_key_sql = if req.multi_source {
            "source_id || '_' || destination_id || '_' || namespace"
        } else {
            "destination_id || '_' || namespace"
        };

        format!(
            r#"
            SELECT
                COALESCE(COUNT(*), 0)::bigint,
                COALESCE(EXTRACT(EPOCH FROM (AGE(NOW(), MIN(
                    COALESCE(metadata->>'nextRetryTime', NOW()::text)::timestamptz
                )))), 0)::float8,
                COALESCE(SUM(EXTRACT(EPOCH FROM AGE(NOW(),
                    COALESCE(metadata->>'nextRetryTime', NOW()::text)::timestamptz
                ))), 0)::float8
            FROM wh_uploads t
            WHERE
                t.destination_type = $3
                AND t.in_progress = FALSE
                AND t.status != 'exported_data'
                AND t.status != 'aborted'
                AND COALESCE(metadata->>'nextRetryTime', NOW()::text)::timestamptz <= NOW()
                AND workspace_id <> ALL ($1)
                AND (({partition_key_sql}) != ALL ($2))
            "#,
            partition_key_sql = partition_key_sql,
        )
    }
}

#[async_trait]
impl JobStore for PgStore {
    async fn latest_end_staging_file_id(
        &self,
        source_id: &str,
        destination_id: &str,
    ) -> Result<i64, StoreError> {
        let row = self
            .client
            .query_one(LATEST_END_STAGING_FILE_ID_SQL, &[&source_id, &destination_id])
            .await?;
        Ok(row.get(0))
    }

    async fn staging_after(
        &self,
        source_id: &str,
        destination_id: &str,
        after_id: i64,
    ) -> Result<Vec<StagingFile>, StoreError> {
        let rows = self
            .client
            .query(STAGING_AFTER_SQL, &[&source_id, &destination_id, &after_id])
            .await?;
        Ok(rows.iter().map(map_staging_file).collect())
    }

    async fn staging_in_range(
        &self,
        source_id: &str,
        destination_id: &str,
        from_id: i64,
        to_id: i64,
    ) -> Result<Vec<StagingFile>, StoreError> {
        let rows = self
            .client
            .query(
                STAGING_IN_RANGE_SQL,
                &[&source_id, &destination_id, &from_id, &to_id],
            )
            .await?;
        Ok(rows.iter().map(map_staging_file).collect())
    }

    async fn insert_job(&self, job: &NewUpload) -> Result<i64, StoreError> {
        let metadata =
            serde_json::to_value(&job.metadata).map_err(StoreError::EncodeMetadata)?;
        let row = self
            .client
            .query_one(
                INSERT_UPLOAD_SQL,
                &[
                    &job.source_id,
                    &job.namespace,
                    &job.workspace_id,
                    &job.destination_id,
                    &job.destination_kind.as_str(),
                    &job.start_staging_file_id,
                    &job.end_staging_file_id,
                    &UploadStatus::Waiting.as_str(),
                    &metadata,
                    &job.first_event_at,
                    &job.last_event_at,
                ],
            )
            .await?;
        Ok(row.get(0))
    }

    async fn latest_job_status(
        &self,
        kind: DestinationKind,
        source_id: &str,
        destination_id: &str,
    ) -> Result<Option<LatestJob>, StoreError> {
        let row = self
            .client
            .query_opt(
                LATEST_JOB_STATUS_SQL,
                &[&kind.as_str(), &source_id, &destination_id],
            )
            .await?;

        row.map(|row| {
            let id: i64 = row.get(0);
            let status: String = row.get(1);
            let status = status
                .parse::<UploadStatus>()
                .map_err(|source| StoreError::BadStatus { id, source })?;
            Ok(LatestJob {
                id,
                status,
                priority: row.get(2),
            })
        })
        .transpose()
    }

    async fn delete_waiting_job(&self, id: i64) -> Result<(), StoreError> {
        self.client.execute(DELETE_WAITING_SQL, &[&id]).await?;
        Ok(())
    }

    async fn claim_jobs(&self, req: &ClaimRequest) -> Result<Vec<Upload>, StoreError> {
        let sql = Self::claim_select_sql(req);
        let rows = self
            .client
            .query(
                &sql,
                &[
                    &req.skipped_workspaces,
                    &req.skipped_partition_keys,
                    &req.destination_kind.as_str(),
                ],
            )
            .await?;

        let mut uploads = Vec::with_capacity(rows.len());
        for row in &rows {
            uploads.push(map_upload(row)?);
        }

        if !uploads.is_empty() {
            let ids: Vec<i64> = uploads.iter().map(|u| u.id).collect();
            self.client
                .execute(
                    "UPDATE wh_uploads SET in_progress = TRUE, updated_at = NOW() WHERE id = ANY($1)",
                    &[&ids],
                )
                .await?;
            for upload in &mut uploads {
                upload.in_progress = true;
            }
        }

        Ok(uploads)
    }

    async fn pending_stats(&self, req: &ClaimRequest) -> Result<PendingStats, StoreError> {
        let sql = Self::pending_stats_sql(req);
        let row = self
            .client
            .query_one(
                &sql,
                &[
                    &req.skipped_workspaces,
                    &req.skipped_partition_keys,
                    &req.destination_kind.as_str(),
                ],
            )
            .await?;
        Ok(PendingStats {
            pending_jobs: row.get(0),
            pickup_lag_seconds: row.get(1),
            pickup_wait_seconds: row.get(2),
        })
    }

    async fn reset_in_progress(&self, kind: DestinationKind) -> Result<(), StoreError> {
        self.client
            .execute(RESET_IN_PROGRESS_SQL, &[&kind.as_str()])
            .await?;
        Ok(())
    }

    async fn interrupted_destinations(
        &self,
        kind: DestinationKind,
    ) -> Result<Vec<String>, StoreError> {
        let rows = self
            .client
            .query(INTERRUPTED_DESTINATIONS_SQL, &[&kind.as_str()])
            .await?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    async fn set_in_progress(&self, id: i64, in_progress: bool) -> Result<(), StoreError> {
        self.client
            .execute(SET_IN_PROGRESS_SQL, &[&id, &in_progress])
            .await?;
        Ok(())
    }

    async fn abort_job(&self, id: i64, reason: &str) -> Result<(), StoreError> {
        let error = serde_json::json!({
            "scheduler": { "errors": [reason], "attempt": 1 }
        });
        self.client.execute(ABORT_UPLOAD_SQL, &[&id, &error]).await?;
        Ok(())
    }

    async fn pending_staging_file_count(&self, by: &PendingBy) -> Result<i64, StoreError> {
        let (column, value) = match by {
            PendingBy::Source(id) => ("source_id", id),
            PendingBy::Destination(id) => ("destination_id", id),
        };

        let max_sql = format!(
            "SELECT COALESCE(MAX(end_staging_file_id), 0) FROM wh_uploads WHERE {column} = $1"
        );
        let last_covered: i64 = self.client.query_one(&max_sql, &[value]).await?.get(0);

        let count_sql = format!(
            "SELECT COUNT(*) FROM wh_staging_files WHERE id > $1 AND {column} = $2"
        );
        let row = self
            .client
            .query_one(&count_sql, &[&last_covered, value])
            .await?;
        Ok(row.get(0))
    }

    async fn pending_upload_count(
        &self,
        source_id: &str,
        source_task_run_id: Option<&str>,
    ) -> Result<i64, StoreError> {
        let row = match source_task_run_id {
            Some(task_run_id) => {
                self.client
                    .query_one(
                        "SELECT COUNT(*) FROM wh_uploads \
                         WHERE status NOT IN ('exported_data', 'aborted') \
                           AND source_id = $1 \
                           AND metadata->>'source_task_run_id' = $2",
                        &[&source_id, &task_run_id],
                    )
                    .await?
            }
            None => {
                self.client
                    .query_one(
                        "SELECT COUNT(*) FROM wh_uploads \
                         WHERE status NOT IN ('exported_data', 'aborted') \
                           AND source_id = $1",
                        &[&source_id],
                    )
                    .await?
            }
        };
        Ok(row.get(0))
    }

    async fn latest_staging_created_in_window(
        &self,
        source_id: &str,
        destination_id: &str,
        window_mins: i64,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let older = 2 * window_mins;
        let row = self
            .client
            .query_opt(
                STAGING_CREATED_WINDOW_SQL,
                &[&source_id, &destination_id, &older, &window_mins],
            )
            .await?;
        Ok(row.map(|row| row.get(0)))
    }

    async fn terminal_upload_exists_since(
        &self,
        source_id: &str,
        destination_id: &str,
        since: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let row = self
            .client
            .query_one(
                TERMINAL_UPLOAD_EXISTS_SQL,
                &[&source_id, &destination_id, &since],
            )
            .await?;
        Ok(row.get(0))
    }

    async fn stored_namespace(
        &self,
        source_id: &str,
        destination_id: &str,
    ) -> Result<Option<String>, StoreError> {
        let row = self
            .client
            .query_opt(STORED_NAMESPACE_SQL, &[&source_id, &destination_id])
            .await?;
        Ok(row.map(|row| row.get(0)))
    }
}

fn map_staging_file(row: &Row) -> StagingFile {
    StagingFile {
        id: row.get(0),
        source_id: row.get(1),
        destination_id: row.get(2),
        total_events: row.get(3),
        first_event_at: row.get(4),
        last_event_at: row.get(5),
        use_rudder_storage: row.get(6),
        source_batch_id: row.get(7),
        source_task_id: row.get(8),
        source_task_run_id: row.get(9),
        source_job_id: row.get(10),
        source_job_run_id: row.get(11),
        created_at: row.get(12),
    }
}

fn map_upload(row: &Row) -> Result<Upload, StoreError> {
    let id: i64 = row.get(0);

    let status: String = row.get(1);
    let status = status
        .parse::<UploadStatus>()
        .map_err(|source| StoreError::BadStatus { id, source })?;

    let destination_type: String = row.get(8);
    let destination_kind = destination_type
        .parse::<DestinationKind>()
        .map_err(|source| StoreError::BadDestinationKind { id, source })?;

    let metadata_value: serde_json::Value = row.get(14);
    let metadata: UploadMetadata = serde_json::from_value(metadata_value)
        .map_err(|source| StoreError::BadJson {
            id,
            column: "metadata",
            source,
        })?;

    let timings: Vec<Timing> = match row.get::<_, Option<serde_json::Value>>(15) {
        Some(value) => serde_json::from_value(value).map_err(|source| StoreError::BadJson {
            id,
            column: "timings",
            source,
        })?,
        None => Vec::new(),
    };

    let error: serde_json::Value = row.get(13);
    let attempts = timings
        .last()
        .and_then(|timing| error.get(timing.status.as_str()))
        .and_then(|entry| entry.get("attempt"))
        .and_then(|attempt| attempt.as_i64())
        .unwrap_or(0);

    Ok(Upload {
        id,
        status,
        schema: row.get(2),
        merged_schema: row.get(3),
        namespace: row.get(4),
        workspace_id: row.get(5),
        source_id: row.get(6),
        destination_id: row.get(7),
        destination_kind,
        start_staging_file_id: row.get(9),
        end_staging_file_id: row.get(10),
        start_load_file_id: row.get(11),
        end_load_file_id: row.get(12),
        error,
        metadata,
        timings,
        priority: row.get(16),
        first_event_at: row.get(17),
        last_event_at: row.get(18),
        in_progress: false,
        attempts,
        created_at: row.get(19),
        updated_at: row.get(20),
    })
}

async fn connect_with_tls(config: Config) -> Result<Client, StoreError> {
    let connector = TlsConnector::builder().build()?;
    let tls = MakeTlsConnector::new(connector);
    let (client, connection) = config.connect(tls).await?;
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            error!(%err, "postgres connection error");
        }
    });
    Ok(client)
}

async fn connect_without_tls(config: Config) -> Result<Client, StoreError> {
    let (client, connection) = config.connect(NoTls).await?;
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            error!(%err, "postgres connection error");
        }
    });
    Ok(client)
}
