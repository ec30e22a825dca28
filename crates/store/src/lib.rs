pub mod error;
pub mod jobs;
pub mod pg;

pub use error::StoreError;
pub use jobs::{ClaimRequest, JobStore, LatestJob, PendingBy, PendingStats};
pub use pg::PgStore;
