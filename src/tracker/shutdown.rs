use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Cancels `cancellation` on ctrl-c. Returns early if the token is cancelled by someone else, so
/// it can be joined with the session without keeping the process alive.
pub async fn detect_shutdown(cancellation: CancellationToken) {
    select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received, stopping");
            cancellation.cancel();
        },
        _ = cancellation.cancelled() => (),
    };
}
