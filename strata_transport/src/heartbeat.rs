use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::lifecycle::Lifecycle;
use crate::TunnelError;

/// Sends one keep-alive probe.
#[async_trait]
pub(crate) trait Pinger: Send + Sync + 'static {
    async fn ping(&self) -> Result<(), TunnelError>;
}

/// Starts a periodic keep-alive and returns the token that stops it.
///
/// The token is a child of the connection token, so closing the connection
/// stops the heartbeat too. A zero interval starts nothing.
pub(crate) fn spawn_heartbeat<P: Pinger>(
    lifecycle: Arc<Lifecycle>,
    interval: Duration,
    pinger: P,
) -> CancellationToken {
    let stop = lifecycle.token().child_token();
    if interval.is_zero() {
        return stop;
    }

    let task_stop = stop.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = task_stop.cancelled() => break,
                _ = ticker.tick() => {
                    if !lifecycle.is_connected() {
                        continue;
                    }
                    let res = tokio::select! {
                        _ = task_stop.cancelled() => break,
                        res = pinger.ping() => res,
                    };
                    if let Err(e) = res {
                        warn!("heartbeat failed, stopping: {}", e);
                        break;
                    }
                }
            }
        }
        debug!("heartbeat stopped");
    });
    stop
}

/// A token that is already stopped, for transports whose carrier keeps
/// itself alive.
pub(crate) fn stopped_token() -> CancellationToken {
    let token = CancellationToken::new();
    token.cancel();
    token
}
