use store::StoreError;
use thiserror::Error;

/// Errors returned by the external loader seam.
pub type RunnerError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("job store error: {0}")]
    Store(#[from] StoreError),

    /// The allocator is the single writer of in-progress flags for its
    /// destination kind; once a claim fails it cannot safely continue.
    #[error("claiming uploads failed, allocator cannot continue: {0}")]
    ClaimFailed(#[source] StoreError),

    #[error("crash recovery failed for destination {destination_id}: {source}")]
    CrashRecovery {
        destination_id: String,
        #[source]
        source: RunnerError,
    },

    #[error("scheduler task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
