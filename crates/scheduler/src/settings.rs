use model::destination::DestinationKind;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

/// Which roles this process plays. Master runs the scheduling core; slave
/// runs load-file workers (out of scope here); embedded runs inside the main
/// data plane process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Master,
    Slave,
    MasterAndSlave,
    Embedded,
    EmbeddedMaster,
}

impl Mode {
    pub fn is_master(&self) -> bool {
        matches!(
            self,
            Mode::Master | Mode::MasterAndSlave | Mode::Embedded | Mode::EmbeddedMaster
        )
    }

    pub fn is_slave(&self) -> bool {
        matches!(self, Mode::Slave | Mode::MasterAndSlave | Mode::Embedded)
    }

    pub fn is_standalone(&self) -> bool {
        !matches!(self, Mode::Embedded | Mode::EmbeddedMaster)
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "master" => Ok(Mode::Master),
            "slave" => Ok(Mode::Slave),
            "master_and_slave" => Ok(Mode::MasterAndSlave),
            "embedded" => Ok(Mode::Embedded),
            "embedded_master" => Ok(Mode::EmbeddedMaster),
            other => Err(format!("unknown warehouse mode: {other}")),
        }
    }
}

/// Per-destination-kind knobs; resolved through [`Settings::router_settings`].
#[derive(Debug, Clone)]
pub struct RouterSettings {
    /// Allocator parallelism: how many uploads may be in flight at once for
    /// the kind.
    pub no_of_workers: usize,
    /// In-flight quota per worker identifier (partition key).
    pub max_concurrent_upload_jobs: usize,
    /// Partition pickup by (source, destination, namespace) instead of
    /// (destination, namespace).
    pub allow_multiple_sources_for_jobs_pickup: bool,
    /// When set, namespaces default to `<prefix>_<source name>` for
    /// destinations that don't name one explicitly.
    pub custom_dataset_prefix: Option<String>,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            no_of_workers: 8,
            max_concurrent_upload_jobs: 1,
            allow_multiple_sources_for_jobs_pickup: false,
            custom_dataset_prefix: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub mode: Mode,
    /// Maximum staging files folded into one upload job.
    pub staging_files_batch_size: usize,
    /// Default per-connection sync interval when the destination config does
    /// not carry a `syncFrequency`.
    pub upload_freq_secs: i64,
    pub main_loop_sleep: Duration,
    /// Creator fan-out bound across connections.
    pub max_parallel_job_creation: usize,
    pub upload_allocator_sleep: Duration,
    pub wait_for_worker_sleep: Duration,
    pub wait_for_config: Duration,
    /// Spread `nextRetryTime` by up to 15s so fleets of connections with the
    /// same frequency don't sync in lockstep.
    pub enable_jitter_for_syncs: bool,
    pub upload_status_track_frequency: Duration,
    /// Grace period (minutes) on top of a connection's sync frequency before
    /// the tracker reports a staging file as left behind.
    pub upload_buffer_time_mins: i64,
    /// How often the tenant watcher refreshes the degraded-workspace set.
    pub degraded_refresh_interval: Duration,
    /// Per-kind overrides, keyed by [`DestinationKind::config_name`].
    pub routers: HashMap<String, RouterSettings>,
    pub default_router: RouterSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            mode: Mode::Embedded,
            staging_files_batch_size: 960,
            upload_freq_secs: 1800,
            main_loop_sleep: Duration::from_secs(5),
            max_parallel_job_creation: 8,
            upload_allocator_sleep: Duration::from_secs(5),
            wait_for_worker_sleep: Duration::from_secs(5),
            wait_for_config: Duration::from_secs(5),
            enable_jitter_for_syncs: false,
            upload_status_track_frequency: Duration::from_secs(30 * 60),
            upload_buffer_time_mins: 180,
            degraded_refresh_interval: Duration::from_secs(30),
            routers: HashMap::new(),
            default_router: RouterSettings::default(),
        }
    }
}

impl Settings {
    /// Defaults overridden by `WAREHOUSE_*` environment variables.
    pub fn from_env() -> Self {
        let mut settings = Self::default();

        if let Some(mode) = env_parse::<Mode>("WAREHOUSE_MODE") {
            settings.mode = mode;
        }
        if let Some(v) = env_parse("WAREHOUSE_STAGING_FILES_BATCH_SIZE") {
            settings.staging_files_batch_size = v;
        }
        if let Some(v) = env_parse("WAREHOUSE_UPLOAD_FREQ_IN_S") {
            settings.upload_freq_secs = v;
        }
        if let Some(v) = env_secs("WAREHOUSE_MAIN_LOOP_SLEEP_IN_S") {
            settings.main_loop_sleep = v;
        }
        if let Some(v) = env_parse("WAREHOUSE_MAX_PARALLEL_JOB_CREATION") {
            settings.max_parallel_job_creation = v;
        }
        if let Some(v) = env_secs("WAREHOUSE_UPLOAD_ALLOCATOR_SLEEP_IN_S") {
            settings.upload_allocator_sleep = v;
        }
        if let Some(v) = env_secs("WAREHOUSE_WAIT_FOR_WORKER_SLEEP_IN_S") {
            settings.wait_for_worker_sleep = v;
        }
        if let Some(v) = env_secs("WAREHOUSE_WAIT_FOR_CONFIG_IN_S") {
            settings.wait_for_config = v;
        }
        if let Some(v) = env_parse("WAREHOUSE_ENABLE_JITTER_FOR_SYNCS") {
            settings.enable_jitter_for_syncs = v;
        }
        if let Some(v) = env_parse::<u64>("WAREHOUSE_UPLOAD_STATUS_TRACK_FREQUENCY_IN_MIN") {
            settings.upload_status_track_frequency = Duration::from_secs(v * 60);
        }
        if let Some(v) = env_parse("WAREHOUSE_UPLOAD_BUFFER_TIME_IN_MIN") {
            settings.upload_buffer_time_mins = v;
        }
        if let Some(v) = env_secs("WAREHOUSE_DEGRADED_REFRESH_IN_S") {
            settings.degraded_refresh_interval = v;
        }

        for kind in model::destination::ALL_KINDS {
            let prefix = format!("WAREHOUSE_{}", kind.config_name().to_uppercase());
            let mut router = settings.default_router.clone();
            let mut touched = false;

            if let Some(v) = env_parse(&format!("{prefix}_NO_OF_WORKERS")) {
                router.no_of_workers = v;
                touched = true;
            }
            if let Some(v) = env_parse(&format!("{prefix}_MAX_CONCURRENT_UPLOAD_JOBS")) {
                router.max_concurrent_upload_jobs = v;
                touched = true;
            }
            if let Some(v) = env_parse(&format!("{prefix}_ALLOW_MULTIPLE_SOURCES_FOR_JOBS_PICKUP"))
            {
                router.allow_multiple_sources_for_jobs_pickup = v;
                touched = true;
            }
            if let Ok(v) = std::env::var(format!("{prefix}_CUSTOM_DATASET_PREFIX")) {
                if !v.is_empty() {
                    router.custom_dataset_prefix = Some(v);
                    touched = true;
                }
            }
            if touched {
                settings
                    .routers
                    .insert(kind.config_name().to_string(), router);
            }
        }

        settings
    }

    pub fn router_settings(&self, kind: DestinationKind) -> RouterSettings {
        self.routers
            .get(kind.config_name())
            .cloned()
            .unwrap_or_else(|| self.default_router.clone())
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|raw| raw.parse().ok())
}

fn env_secs(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_secs)
}
