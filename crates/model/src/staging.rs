use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata row of one staged batch of events sitting in object storage,
/// waiting to be folded into an upload job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingFile {
    pub id: i64,
    pub source_id: String,
    pub destination_id: String,
    pub total_events: i64,
    pub first_event_at: Option<DateTime<Utc>>,
    pub last_event_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub use_rudder_storage: bool,
    #[serde(default)]
    pub source_batch_id: Option<String>,
    #[serde(default)]
    pub source_task_id: Option<String>,
    #[serde(default)]
    pub source_task_run_id: Option<String>,
    #[serde(default)]
    pub source_job_id: Option<String>,
    #[serde(default)]
    pub source_job_run_id: Option<String>,
}
