use crate::memory::MemoryStore;
use async_trait::async_trait;
use chrono::Utc;
use model::config::{
    ControlPlaneSnapshot, Destination, DestinationDefinition, Source, WorkspaceConfig,
};
use model::connection::Connection;
use model::destination::DestinationKind;
use model::staging::StagingFile;
use model::upload::{Upload, UploadMetadata, UploadStatus};
use scheduler::context::SchedulerContext;
use scheduler::error::RunnerError;
use scheduler::metrics::SchedulerMetrics;
use scheduler::router::RouterDeps;
use scheduler::runner::{PickedUpload, UploadRunner};
use scheduler::settings::Settings;
use scheduler::tenant::{config_channel, FixedDegradedOracle, TenantManager};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Loader double: records every run and crash recovery; optionally blocks
/// runs behind a gate, fails the next recovery, or writes a terminal status
/// back like a real loader would.
#[derive(Default)]
pub struct RecordingRunner {
    runs: Mutex<Vec<i64>>,
    recoveries: Mutex<Vec<String>>,
    fail_next_recovery: AtomicBool,
    block_runs: AtomicBool,
    release: tokio::sync::Notify,
    complete_into: Mutex<Option<Arc<MemoryStore>>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn runs(&self) -> Vec<i64> {
        self.runs.lock().unwrap().clone()
    }

    pub fn recoveries(&self) -> Vec<String> {
        self.recoveries.lock().unwrap().clone()
    }

    pub fn fail_next_recovery(&self) {
        self.fail_next_recovery.store(true, Ordering::SeqCst);
    }

    /// Hold every run until [`RecordingRunner::release_runs`], keeping jobs
    /// in flight.
    pub fn block_runs(&self) {
        self.block_runs.store(true, Ordering::SeqCst);
    }

    pub fn release_runs(&self) {
        self.block_runs.store(false, Ordering::SeqCst);
        self.release.notify_waiters();
    }

    /// Mark uploads `exported_data` in the given store after each run, as the
    /// real loader's state machine would.
    pub fn complete_into(&self, store: Arc<MemoryStore>) {
        *self.complete_into.lock().unwrap() = Some(store);
    }
}

#[async_trait]
impl UploadRunner for RecordingRunner {
    async fn run(&self, job: PickedUpload) -> Result<(), RunnerError> {
        self.runs.lock().unwrap().push(job.upload.id);
        while self.block_runs.load(Ordering::SeqCst) {
            self.release.notified().await;
        }
        let store = self.complete_into.lock().unwrap().clone();
        if let Some(store) = store {
            store.set_status(job.upload.id, UploadStatus::ExportedData);
        }
        Ok(())
    }

    async fn crash_recover(&self, connection: &Connection) -> Result<(), RunnerError> {
        self.recoveries
            .lock()
            .unwrap()
            .push(connection.destination.id.clone());
        if self.fail_next_recovery.swap(false, Ordering::SeqCst) {
            return Err("temp table cleanup failed".into());
        }
        Ok(())
    }
}

/// Settings tuned for tests: production defaults with sub-second sleeps.
pub fn test_settings() -> Settings {
    Settings {
        main_loop_sleep: Duration::from_millis(25),
        upload_allocator_sleep: Duration::from_millis(25),
        wait_for_worker_sleep: Duration::from_millis(25),
        wait_for_config: Duration::from_millis(25),
        upload_status_track_frequency: Duration::from_millis(200),
        degraded_refresh_interval: Duration::from_millis(50),
        ..Settings::default()
    }
}

pub fn destination(id: &str, kind: DestinationKind) -> Destination {
    Destination {
        id: id.to_string(),
        name: format!("{id} warehouse"),
        enabled: true,
        config: serde_json::Map::new(),
        destination_definition: DestinationDefinition {
            name: kind.as_str().to_string(),
        },
    }
}

pub fn source(id: &str, name: &str, destinations: Vec<Destination>) -> Source {
    Source {
        id: id.to_string(),
        name: name.to_string(),
        enabled: true,
        source_definition: Default::default(),
        destinations,
    }
}

pub fn snapshot(workspace_id: &str, sources: Vec<Source>) -> ControlPlaneSnapshot {
    let mut snapshot = ControlPlaneSnapshot::new();
    snapshot.insert(
        workspace_id.to_string(),
        WorkspaceConfig {
            sources,
            connection_flags: Default::default(),
        },
    );
    snapshot
}

pub fn staging_file(
    id: i64,
    source_id: &str,
    destination_id: &str,
    use_rudder_storage: bool,
) -> StagingFile {
    StagingFile {
        id,
        source_id: source_id.to_string(),
        destination_id: destination_id.to_string(),
        total_events: 100,
        first_event_at: Some(Utc::now()),
        last_event_at: Some(Utc::now()),
        created_at: Utc::now(),
        use_rudder_storage,
        source_batch_id: None,
        source_task_id: None,
        source_task_run_id: None,
        source_job_id: None,
        source_job_run_id: None,
    }
}

/// A bare upload row for seeding pre-existing store states; ids are assigned
/// by [`MemoryStore::seed_upload`].
pub fn upload_row(
    source_id: &str,
    destination_id: &str,
    namespace: &str,
    kind: DestinationKind,
    range: (i64, i64),
    status: UploadStatus,
    priority: Option<i32>,
) -> Upload {
    let now = Utc::now();
    let metadata = UploadMetadata {
        priority,
        ..Default::default()
    };
    Upload {
        id: 0,
        source_id: source_id.to_string(),
        namespace: namespace.to_string(),
        workspace_id: "ws-1".to_string(),
        destination_id: destination_id.to_string(),
        destination_kind: kind,
        start_staging_file_id: range.0,
        end_staging_file_id: range.1,
        start_load_file_id: 0,
        end_load_file_id: 0,
        status,
        in_progress: false,
        schema: serde_json::json!({}),
        merged_schema: serde_json::json!({}),
        error: serde_json::json!({}),
        priority: metadata.priority(),
        metadata,
        timings: Vec::new(),
        first_event_at: None,
        last_event_at: None,
        attempts: 0,
        created_at: now,
        updated_at: now,
    }
}

/// Shared wiring for one test: store, runner, tenant, context and a deps
/// template with a fresh cancellation root.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub runner: Arc<RecordingRunner>,
    pub oracle: Arc<FixedDegradedOracle>,
    pub tenant: Arc<TenantManager>,
    pub context: Arc<SchedulerContext>,
    pub metrics: SchedulerMetrics,
    pub config_tx: watch::Sender<Arc<ControlPlaneSnapshot>>,
    pub cancel: CancellationToken,
    pub settings: Arc<Settings>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(test_settings())
    }

    pub fn with_settings(settings: Settings) -> Self {
        let (config_tx, config_rx) = config_channel();
        let oracle = Arc::new(FixedDegradedOracle::new());
        let settings = Arc::new(settings);
        let tenant = Arc::new(TenantManager::new(
            config_rx,
            oracle.clone(),
            settings.degraded_refresh_interval,
        ));
        Self {
            store: Arc::new(MemoryStore::new()),
            runner: Arc::new(RecordingRunner::new()),
            oracle,
            tenant,
            context: Arc::new(SchedulerContext::new()),
            metrics: SchedulerMetrics::new(),
            config_tx,
            cancel: CancellationToken::new(),
            settings,
        }
    }

    /// Deps for one router, with its own child cancellation token — the same
    /// shape the supervisor hands out.
    pub fn router_deps(&self) -> RouterDeps {
        RouterDeps {
            settings: self.settings.clone(),
            store: self.store.clone(),
            runner: self.runner.clone(),
            tenant: self.tenant.clone(),
            context: self.context.clone(),
            metrics: self.metrics.clone(),
            ssh_keys: None,
            cancel: self.cancel.child_token(),
        }
    }

    pub fn push_config(&self, snapshot: ControlPlaneSnapshot) {
        let _ = self.config_tx.send(Arc::new(snapshot));
    }

    pub async fn connection(&self, destination_id: &str, source_id: &str) -> Connection {
        self.context
            .connection(destination_id, source_id)
            .await
            .expect("connection not in registry")
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

/// Poll until `check` passes or the timeout elapses; panics on timeout.
pub async fn wait_for<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if check() {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
