use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Sleep that wakes up early on shutdown. Returns true when the token was
/// cancelled, so loops can `break` instead of starting another pass.
pub(crate) async fn sleep_or_cancelled(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}
