use crate::destination::{DestinationKind, LoadFileType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Priority given to uploads with no explicit priority; lower sorts first.
pub const DEFAULT_PRIORITY: i32 = 100;
/// Priority given to manually triggered uploads so they overtake the backlog.
pub const TRIGGERED_PRIORITY: i32 = 50;

/// Lifecycle states of an upload job. The scheduler only creates `Waiting`
/// rows and reads the terminal pair; everything in between is written by the
/// downstream loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Waiting,
    GeneratedUploadSchema,
    CreatedTableUploads,
    GeneratingLoadFiles,
    GeneratedLoadFiles,
    UpdatedTableUploads,
    ExportingData,
    ExportingDataFailed,
    ExportedData,
    Aborted,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Waiting => "waiting",
            UploadStatus::GeneratedUploadSchema => "generated_upload_schema",
            UploadStatus::CreatedTableUploads => "created_table_uploads",
            UploadStatus::GeneratingLoadFiles => "generating_load_files",
            UploadStatus::GeneratedLoadFiles => "generated_load_files",
            UploadStatus::UpdatedTableUploads => "updated_table_uploads",
            UploadStatus::ExportingData => "exporting_data",
            UploadStatus::ExportingDataFailed => "exporting_data_failed",
            UploadStatus::ExportedData => "exported_data",
            UploadStatus::Aborted => "aborted",
        }
    }

    /// Terminal uploads are never selected by the allocator again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadStatus::ExportedData | UploadStatus::Aborted)
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown upload status: {0}")]
pub struct UnknownUploadStatus(pub String);

impl FromStr for UploadStatus {
    type Err = UnknownUploadStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        const ALL: [UploadStatus; 10] = [
            UploadStatus::Waiting,
            UploadStatus::GeneratedUploadSchema,
            UploadStatus::CreatedTableUploads,
            UploadStatus::GeneratingLoadFiles,
            UploadStatus::GeneratedLoadFiles,
            UploadStatus::UpdatedTableUploads,
            UploadStatus::ExportingData,
            UploadStatus::ExportingDataFailed,
            UploadStatus::ExportedData,
            UploadStatus::Aborted,
        ];
        ALL.iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownUploadStatus(s.to_string()))
    }
}

/// One `{status, time}` record of the `timings` column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timing {
    pub status: UploadStatus,
    pub time: DateTime<Utc>,
}

/// The `metadata` jsonb column. Key spellings are fixed by the existing
/// table contents, hence the mixed naming.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadMetadata {
    #[serde(default)]
    pub use_rudder_storage: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_batch_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_task_run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_job_run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_file_type: Option<LoadFileType>,
    #[serde(
        rename = "nextRetryTime",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub next_retry_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
}

impl UploadMetadata {
    pub fn priority(&self) -> i32 {
        self.priority.unwrap_or(DEFAULT_PRIORITY)
    }
}

/// A persisted upload job row.
#[derive(Debug, Clone)]
pub struct Upload {
    pub id: i64,
    pub source_id: String,
    pub namespace: String,
    pub workspace_id: String,
    pub destination_id: String,
    pub destination_kind: DestinationKind,
    pub start_staging_file_id: i64,
    pub end_staging_file_id: i64,
    pub start_load_file_id: i64,
    pub end_load_file_id: i64,
    pub status: UploadStatus,
    pub in_progress: bool,
    pub schema: serde_json::Value,
    pub merged_schema: serde_json::Value,
    pub error: serde_json::Value,
    pub metadata: UploadMetadata,
    pub timings: Vec<Timing>,
    pub first_event_at: Option<DateTime<Utc>>,
    pub last_event_at: Option<DateTime<Utc>>,
    pub priority: i32,
    /// Attempt count of the most recent status, as recorded by the loader in
    /// the error blob (`{"<status>": {"attempt": N, ...}}`).
    pub attempts: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Upload {
    /// Partition key under which in-flight exclusivity is enforced.
    pub fn partition_key(&self, multi_source: bool) -> String {
        if multi_source {
            format!(
                "{}_{}_{}",
                self.source_id, self.destination_id, self.namespace
            )
        } else {
            format!("{}_{}", self.destination_id, self.namespace)
        }
    }
}

/// Payload for inserting a fresh upload job; the store fills in the row id
/// and timestamps.
#[derive(Debug, Clone)]
pub struct NewUpload {
    pub source_id: String,
    pub namespace: String,
    pub workspace_id: String,
    pub destination_id: String,
    pub destination_kind: DestinationKind,
    pub start_staging_file_id: i64,
    pub end_staging_file_id: i64,
    pub first_event_at: Option<DateTime<Utc>>,
    pub last_event_at: Option<DateTime<Utc>>,
    pub metadata: UploadMetadata,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_round_trip() {
        for s in [
            "waiting",
            "exporting_data",
            "exporting_data_failed",
            "exported_data",
            "aborted",
        ] {
            assert_eq!(s.parse::<UploadStatus>().unwrap().as_str(), s);
        }
    }

    #[test]
    fn only_exported_and_aborted_are_terminal() {
        assert!(UploadStatus::ExportedData.is_terminal());
        assert!(UploadStatus::Aborted.is_terminal());
        assert!(!UploadStatus::Waiting.is_terminal());
        assert!(!UploadStatus::ExportingDataFailed.is_terminal());
    }

    #[test]
    fn metadata_serializes_next_retry_time_with_legacy_key() {
        let meta = UploadMetadata {
            next_retry_time: Some(Utc::now()),
            priority: Some(TRIGGERED_PRIORITY),
            ..Default::default()
        };
        let json = serde_json::to_value(&meta).unwrap();
        assert!(json.get("nextRetryTime").is_some());
        assert_eq!(json["priority"], TRIGGERED_PRIORITY);
    }

    #[test]
    fn missing_priority_defaults_to_100() {
        let meta: UploadMetadata = serde_json::from_str("{}").unwrap();
        assert_eq!(meta.priority(), DEFAULT_PRIORITY);
    }
}
