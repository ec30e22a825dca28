use crate::allocator::Allocator;
use crate::context::SchedulerContext;
use crate::creator::Creator;
use crate::error::SchedulerError;
use crate::metrics::SchedulerMetrics;
use crate::recovery;
use crate::registry::{Registry, SshKeyResolver};
use crate::runner::{PickedUpload, UploadRunner};
use crate::settings::{RouterSettings, Settings};
use crate::tenant::TenantManager;
use crate::tracker::Tracker;
use model::connection::Connection;
use model::destination::DestinationKind;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use store::JobStore;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Everything a router needs from the outside world.
#[derive(Clone)]
pub struct RouterDeps {
    pub settings: Arc<Settings>,
    pub store: Arc<dyn JobStore>,
    pub runner: Arc<dyn UploadRunner>,
    pub tenant: Arc<TenantManager>,
    pub context: Arc<SchedulerContext>,
    pub metrics: SchedulerMetrics,
    pub ssh_keys: Option<Arc<dyn SshKeyResolver>>,
    pub cancel: CancellationToken,
}

/// Shared state of one destination-kind router; every task holds an Arc.
pub struct RouterState {
    pub(crate) kind: DestinationKind,
    pub(crate) settings: Arc<Settings>,
    pub(crate) router_settings: RouterSettings,
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) runner: Arc<dyn UploadRunner>,
    pub(crate) tenant: Arc<TenantManager>,
    pub(crate) context: Arc<SchedulerContext>,
    pub(crate) metrics: SchedulerMetrics,
    pub(crate) ssh_keys: Option<Arc<dyn SshKeyResolver>>,
    pub(crate) cancel: CancellationToken,
    pub(crate) enabled: AtomicBool,
    pub(crate) initial_config_fetched: AtomicBool,
    /// The live connection list for this kind; rebuilt wholesale per config
    /// snapshot under the write half.
    pub(crate) warehouses: RwLock<Vec<Connection>>,
    /// Worker identifier -> input channel. Looked up under the read half,
    /// sends happen after the guard is dropped.
    pub(crate) worker_channels: RwLock<HashMap<String, mpsc::Sender<PickedUpload>>>,
    pub(crate) worker_tasks: StdMutex<Vec<JoinHandle<()>>>,
    /// Worker identifier -> ids of jobs currently owned by that identifier.
    pub(crate) in_progress: StdMutex<HashMap<String, Vec<i64>>>,
    /// Serializes the "read latest Waiting job / delete / claim / mark
    /// in-progress" critical sections of the creator and the allocator.
    pub(crate) enqueue_lock: Mutex<()>,
    pub(crate) active_workers: AtomicUsize,
}

impl RouterState {
    pub fn kind(&self) -> DestinationKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn initial_config_fetched(&self) -> bool {
        self.initial_config_fetched.load(Ordering::SeqCst)
    }

    pub fn active_worker_count(&self) -> usize {
        self.active_workers.load(Ordering::SeqCst)
    }

    pub(crate) fn multi_source(&self) -> bool {
        self.router_settings.allow_multiple_sources_for_jobs_pickup
    }

    pub(crate) fn worker_identifier(&self, connection: &Connection) -> String {
        connection.worker_identifier(self.multi_source())
    }

    pub(crate) fn add_in_progress(&self, identifier: &str, job_id: i64) {
        let mut in_progress = self.in_progress.lock().unwrap();
        in_progress
            .entry(identifier.to_string())
            .or_default()
            .push(job_id);
    }

    pub(crate) fn remove_in_progress(&self, identifier: &str, job_id: i64) {
        let mut in_progress = self.in_progress.lock().unwrap();
        if let Some(jobs) = in_progress.get_mut(identifier) {
            jobs.retain(|id| *id != job_id);
        }
    }

    pub fn is_job_in_progress(&self, identifier: &str, job_id: i64) -> bool {
        let in_progress = self.in_progress.lock().unwrap();
        in_progress
            .get(identifier)
            .map(|jobs| jobs.contains(&job_id))
            .unwrap_or(false)
    }

    /// Worker identifiers whose in-flight quota is already full; the
    /// allocator excludes their partitions from the next claim.
    pub(crate) fn saturated_partitions(&self) -> Vec<String> {
        let in_progress = self.in_progress.lock().unwrap();
        in_progress
            .iter()
            .filter(|(_, jobs)| jobs.len() >= self.router_settings.max_concurrent_upload_jobs)
            .map(|(identifier, _)| identifier.clone())
            .collect()
    }

    pub(crate) async fn close_worker_channels(&self) {
        self.worker_channels.write().await.clear();
    }
}

/// One scheduler instance per warehouse destination kind: owns the config
/// subscriber, job creator, job allocator, status tracker and tenant watcher
/// for that kind.
pub struct Router {
    state: Arc<RouterState>,
    tasks: JoinSet<Result<(), SchedulerError>>,
}

impl Router {
    /// Build the router and run boot-time recovery (interrupted-destination
    /// snapshot, in-progress reset). Long-running tasks start with
    /// [`Router::start`]. Setup-time store failures abort construction.
    pub async fn new(kind: DestinationKind, deps: RouterDeps) -> Result<Self, SchedulerError> {
        let router_settings = deps.settings.router_settings(kind);
        let state = Arc::new(RouterState {
            kind,
            router_settings,
            settings: deps.settings,
            store: deps.store,
            runner: deps.runner,
            tenant: deps.tenant,
            context: deps.context,
            metrics: deps.metrics,
            ssh_keys: deps.ssh_keys,
            cancel: deps.cancel,
            enabled: AtomicBool::new(false),
            initial_config_fetched: AtomicBool::new(false),
            warehouses: RwLock::new(Vec::new()),
            worker_channels: RwLock::new(HashMap::new()),
            worker_tasks: StdMutex::new(Vec::new()),
            in_progress: StdMutex::new(HashMap::new()),
            enqueue_lock: Mutex::new(()),
            active_workers: AtomicUsize::new(0),
        });

        recovery::prepare(&state).await?;
        state.enabled.store(true, Ordering::SeqCst);

        Ok(Self {
            state,
            tasks: JoinSet::new(),
        })
    }

    /// Build and start: the production path taken by the supervisor.
    pub async fn setup(kind: DestinationKind, deps: RouterDeps) -> Result<Self, SchedulerError> {
        let mut router = Self::new(kind, deps).await?;
        router.start();
        Ok(router)
    }

    /// Spawn the router's five long-running tasks.
    pub fn start(&mut self) {
        info!(dest_type = %self.state.kind, "warehouse router started");

        let registry = Registry::new(self.state.clone());
        self.tasks.spawn(async move { registry.run().await });

        let creator = Creator::new(self.state.clone());
        self.tasks.spawn(async move { creator.run().await });

        let allocator = Allocator::new(self.state.clone());
        self.tasks.spawn(async move { allocator.run().await });

        let tracker = Tracker::new(self.state.clone());
        self.tasks.spawn(async move { tracker.run().await });

        let state = self.state.clone();
        self.tasks.spawn(async move {
            state.tenant.run(state.cancel.clone()).await;
            Ok(())
        });
    }

    pub fn state(&self) -> &Arc<RouterState> {
        &self.state
    }

    /// Idempotent: a disabled router keeps its allocator and workers draining
    /// in-flight jobs; only the creator's main loop pauses.
    pub fn enable(&self) {
        self.state.enabled.store(true, Ordering::SeqCst);
    }

    pub fn disable(&self) {
        self.state.enabled.store(false, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.state.is_enabled()
    }

    /// Cancel every task, wait for loops to unwind and workers to drain.
    pub async fn shutdown(mut self) -> Result<(), SchedulerError> {
        self.state.cancel.cancel();

        let mut first_error = None;
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!(dest_type = %self.state.kind, error = %err, "router task failed");
                    first_error.get_or_insert(err);
                }
                Err(err) => {
                    error!(dest_type = %self.state.kind, error = %err, "router task panicked");
                    first_error.get_or_insert(SchedulerError::Join(err));
                }
            }
        }

        // Normally closed by the allocator on its way out; also here so a
        // router that never started its loops still releases its workers.
        self.state.close_worker_channels().await;

        let workers = {
            let mut worker_tasks = self.state.worker_tasks.lock().unwrap();
            std::mem::take(&mut *worker_tasks)
        };
        for handle in workers {
            if let Err(err) = handle.await {
                error!(dest_type = %self.state.kind, error = %err, "worker task panicked");
                first_error.get_or_insert(SchedulerError::Join(err));
            }
        }

        info!(dest_type = %self.state.kind, "warehouse router stopped");
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
