use crate::error::SchedulerError;
use crate::router::RouterState;
use tracing::info;

/// Boot-time recovery, run before the router's allocator and creator start:
/// snapshot the destinations whose exports were interrupted by a crash, then
/// sweep every stale in-progress flag of the kind. The sweep is safe exactly
/// because nothing is allocating yet.
pub(crate) async fn prepare(state: &RouterState) -> Result<(), SchedulerError> {
    if state.kind.crash_recoverable() {
        let interrupted = state.store.interrupted_destinations(state.kind).await?;
        if !interrupted.is_empty() {
            info!(
                dest_type = %state.kind,
                destinations = interrupted.len(),
                "destinations need crash recovery"
            );
        }
        state.context.mark_interrupted(interrupted).await;
    }

    state.store.reset_in_progress(state.kind).await?;
    Ok(())
}
