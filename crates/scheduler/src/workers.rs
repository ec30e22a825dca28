use crate::router::RouterState;
use crate::runner::PickedUpload;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error};

/// Upper bound on jobs buffered per worker identifier; the allocator blocks
/// once it is reached, propagating backpressure.
pub(crate) const WORKER_CHANNEL_CAPACITY: usize = 1000;

/// Lazily create the worker pool for an identifier: one bounded channel and
/// `max_concurrent_upload_jobs` drainers. Pools are never recreated for an
/// identifier and their channels close only at shutdown.
pub(crate) async fn ensure_worker(state: &Arc<RouterState>, identifier: &str) {
    let mut channels = state.worker_channels.write().await;
    if channels.contains_key(identifier) {
        return;
    }

    let (tx, rx) = mpsc::channel::<PickedUpload>(WORKER_CHANNEL_CAPACITY);
    channels.insert(identifier.to_string(), tx);
    drop(channels);

    debug!(dest_type = %state.kind, identifier, "spawning worker pool");

    let rx = Arc::new(Mutex::new(rx));
    let mut worker_tasks = state.worker_tasks.lock().unwrap();
    for _ in 0..state.router_settings.max_concurrent_upload_jobs {
        let state = state.clone();
        let rx = rx.clone();
        let identifier = identifier.to_string();
        worker_tasks.push(tokio::spawn(async move {
            drain(state, rx, identifier).await;
        }));
    }
}

/// One worker: pull jobs until the channel closes, run each through the
/// loader, and release ownership whatever the outcome.
async fn drain(
    state: Arc<RouterState>,
    rx: Arc<Mutex<mpsc::Receiver<PickedUpload>>>,
    identifier: String,
) {
    loop {
        let job = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let Some(job) = job else {
            break;
        };

        let job_id = job.upload.id;
        state.active_workers.fetch_add(1, Ordering::SeqCst);

        if let Err(err) = state.runner.run(job).await {
            error!(
                dest_type = %state.kind,
                identifier = %identifier,
                upload_id = job_id,
                error = %err,
                "upload job failed"
            );
        }

        if let Err(err) = state.store.set_in_progress(job_id, false).await {
            error!(
                dest_type = %state.kind,
                upload_id = job_id,
                error = %err,
                "failed to clear in-progress flag"
            );
        }

        state.remove_in_progress(&identifier, job_id);
        state.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    debug!(dest_type = %state.kind, identifier = %identifier, "worker drained");
}
