//! Background sweep for silent sessions.
//!
//! A session that stops heartbeating is only ever detected here: transport
//! close events are not guaranteed to fire.

use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::registry::SessionRegistry;

/// Run the reaper loop until `cancel` is triggered.
pub async fn run(registry: SessionRegistry, interval: Duration, cancel: CancellationToken) {
    tracing::info!(interval_ms = interval.as_millis() as u64, "Session reaper started");

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Session reaper stopping");
                break;
            }
            _ = ticker.tick() => {
                match registry.reap().await {
                    Ok(reaped) if !reaped.is_empty() => {
                        tracing::info!(count = reaped.len(), "Reaped sessions");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!(error = %e, "Session reaper: registry unavailable");
                        break;
                    }
                }
            }
        }
    }
}
