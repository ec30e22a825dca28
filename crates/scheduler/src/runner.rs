use crate::error::RunnerError;
use async_trait::async_trait;
use model::connection::Connection;
use model::staging::StagingFile;
use model::upload::Upload;

/// A claimed upload job, hydrated and ready to hand to the loader: the row,
/// the staging files it covers, and the resolved connection.
#[derive(Debug, Clone)]
pub struct PickedUpload {
    pub upload: Upload,
    pub staging_files: Vec<StagingFile>,
    pub connection: Connection,
}

impl PickedUpload {
    pub fn staging_file_ids(&self) -> Vec<i64> {
        self.staging_files.iter().map(|file| file.id).collect()
    }
}

/// The warehouse-specific loader ("manager"). Implementations perform schema
/// migration, load-file generation and the final COPY/MERGE — all opaque to
/// the scheduler, which only dispatches work and respects `nextRetryTime`.
#[async_trait]
pub trait UploadRunner: Send + Sync {
    /// Drive one upload job to completion or failure. State transitions and
    /// retry bookkeeping on the row are the implementation's business.
    async fn run(&self, job: PickedUpload) -> Result<(), RunnerError>;

    /// Clean up partial state (pending temp tables and the like) left behind
    /// by a crashed process, before new jobs are created for the connection.
    async fn crash_recover(&self, connection: &Connection) -> Result<(), RunnerError>;
}
