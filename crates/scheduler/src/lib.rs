//! Upload scheduling core: turns staging files deposited by upstream
//! producers into upload jobs and drives them through per-destination worker
//! pools, with fairness, priority, degraded-tenant isolation and crash
//! recovery.
//!
//! One [`supervisor::Supervisor`] per master process owns one
//! [`router::Router`] per warehouse destination kind; each router runs a
//! config subscriber, a job creator, a job allocator, an upload-status
//! tracker and a tenant watcher. Warehouse-specific loading is behind the
//! [`runner::UploadRunner`] seam.

pub mod allocator;
pub mod context;
pub mod creator;
pub mod error;
pub mod metrics;
pub mod recovery;
pub mod registry;
pub mod router;
pub mod runner;
pub mod settings;
pub mod supervisor;
pub mod tenant;
pub mod tracker;
pub mod workers;

mod pause;

pub use error::SchedulerError;
pub use router::{Router, RouterDeps};
pub use runner::{PickedUpload, UploadRunner};
pub use supervisor::Supervisor;
