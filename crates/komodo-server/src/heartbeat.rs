//! Liveness checks for one connection.

use std::sync::Arc;
use std::time::Duration;

use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::transport::Connection;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// No traffic from the peer for a whole timeout window.
    TimedOut,
    Cancelled,
}

/// Check the connection's alive flag every `interval`.
///
/// Any inbound frame or pong sets the flag. After `timeout / interval`
/// consecutive silent ticks (at least one) the connection is reported dead.
pub async fn run_heartbeat(
    connection: Arc<Connection>,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) -> HeartbeatResult {
    let mut check_interval = time::interval(interval);
    let _ = check_interval.tick().await;
    let mut missed: u32 = 0;
    let interval_ms = interval.as_millis().max(1);
    let max_missed = u32::try_from(timeout.as_millis() / interval_ms)
        .unwrap_or(u32::MAX)
        .max(1);

    loop {
        tokio::select! {
            _ = check_interval.tick() => {
                if connection.check_alive() {
                    missed = 0;
                } else {
                    missed += 1;
                    if missed >= max_missed {
                        return HeartbeatResult::TimedOut;
                    }
                }
            }
            () = cancel.cancelled() => return HeartbeatResult::Cancelled,
        }
    }
}
