//! Retry/backoff wrapper shared by every source's connect-and-run cycle.
//!
//! Backoff state lives inside one `supervise` call, so each source instance
//! retries on its own schedule.

use std::future::Future;
use std::time::Duration;

use log::{error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::error::{BridgeError, Result};

/// Delay schedule between reconnect attempts. `attempt` starts at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// `min(step × attempt, max)`
    Linear { step: Duration, max: Duration },
    /// `min(base × 2^(attempt-1), max)`
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    /// Schedule used by the BLE connection loop.
    pub const BLE: Backoff = Backoff::Linear {
        step: Duration::from_millis(2000),
        max: Duration::from_millis(30_000),
    };

    /// Schedule used by network sources.
    pub const NETWORK: Backoff = Backoff::Exponential {
        base: Duration::from_secs(1),
        max: Duration::from_secs(30),
    };

    pub fn delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match *self {
            Backoff::Linear { step, max } => step.saturating_mul(attempt).min(max),
            Backoff::Exponential { base, max } => {
                let shift = (attempt - 1).min(16);
                base.saturating_mul(1u32 << shift).min(max)
            }
        }
    }
}

/// Sleep for `duration` unless `cancel` fires first.
///
/// Returns `false` when cancelled.
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// How one run of a supervised operation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The session was established before it ended; the attempt counter resets.
    Connected,
    /// The operation gave up before establishing anything.
    NotConnected,
}

/// Rerun `op` until `cancel` fires, backing off between runs.
///
/// Transient errors and clean session ends are retried. A
/// [`BridgeError::Configuration`] error stops the loop: no amount of retrying
/// fixes a missing parameter.
pub async fn supervise<F, Fut>(label: &str, backoff: Backoff, cancel: CancellationToken, mut op: F)
where
    F: FnMut(CancellationToken) -> Fut,
    Fut: Future<Output = Result<SessionEnd>>,
{
    let mut attempt: u32 = 0;
    loop {
        let outcome = tokio::select! {
            _ = cancel.cancelled() => break,
            r = op(cancel.clone()) => r,
        };

        match outcome {
            Ok(SessionEnd::Connected) => {
                attempt = 0;
                info!("{label}: session ended, reconnecting");
            }
            Ok(SessionEnd::NotConnected) => {}
            Err(BridgeError::Configuration(msg)) => {
                error!("{label}: {msg}; giving up");
                break;
            }
            Err(e) => warn!("{label}: {e}"),
        }

        if cancel.is_cancelled() {
            break;
        }
        attempt = attempt.saturating_add(1);
        let delay = backoff.delay(attempt);
        info!("{label}: retry #{attempt} in {delay:?}");
        if !sleep_or_cancel(delay, &cancel).await {
            break;
        }
    }
    info!("{label}: supervisor stopped");
}
