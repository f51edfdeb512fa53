//! Two-tick liveness sweep over all sessions

use crate::registry::SessionRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Run the sweep every `interval` until cancelled
///
/// A session that has not answered the previous ping by the next tick is
/// terminated, so an unresponsive peer lives at most two intervals.
pub async fn run_heartbeat(
    sessions: Arc<SessionRegistry>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = time::interval(interval);
    // Skip the immediate first tick
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let terminated = sweep(&sessions);
                if terminated > 0 {
                    debug!("Heartbeat terminated {} sessions", terminated);
                }
            }
            () = cancel.cancelled() => break,
        }
    }
}

/// One heartbeat pass, returning how many sessions were terminated
pub fn sweep(sessions: &SessionRegistry) -> usize {
    let mut terminated = 0;

    for session in sessions.all() {
        if !session.begin_heartbeat() {
            warn!(
                "Terminating unresponsive session {} from {}",
                session.identity(),
                session.remote()
            );
            session.terminate();
            terminated += 1;
        } else if !session.ping() {
            debug!("Ping to {} was not queued", session.identity());
        }
    }

    terminated
}
