//! Heartbeat pulse simulator.
//!
//! Approximates systole/diastole timing from the current BPM and drives the
//! `isHRBeat` parameter:
//!
//! ```text
//!  false ──(60 / (bpm - 0.2) s)──► true ──(settle)──► false ...
//! ```
//!
//! With no source, or `bpm == 0`, it reports [`BeatState::Waiting`] and
//! checks again every second.

use std::time::Duration;

use log::debug;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::supervisor::sleep_or_cancel;

/// Poll period while there is nothing to beat to.
pub const WAITING_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeatState {
    /// No usable BPM.
    Waiting,
    Between,
    Beat,
}

impl BeatState {
    pub fn is_beat(self) -> bool {
        self == BeatState::Beat
    }
}

/// Seconds between beats, `1 / ((bpm - 0.2) / 60)`.
///
/// `None` wherever the formula is undefined or non-positive (any `bpm` at or
/// below 0.2).
pub fn beat_interval(bpm: f64) -> Option<Duration> {
    if !(bpm > 0.0) {
        return None;
    }
    let secs = 1.0 / ((bpm - 0.2) / 60.0);
    if !secs.is_finite() || secs <= 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(secs).ok()
}

/// Run until `cancel`, reading the authoritative BPM from `bpm` (`None`
/// when no source is present) and reporting every state to `emit`.
///
/// Emits [`BeatState::Waiting`] once more on exit.
pub async fn run<F>(
    mut bpm: watch::Receiver<Option<u32>>,
    settle: Duration,
    cancel: CancellationToken,
    mut emit: F,
) where
    F: FnMut(BeatState) + Send,
{
    debug!("heartbeat: started");
    loop {
        let current = *bpm.borrow_and_update();
        let interval = current.filter(|b| *b > 0).and_then(|b| beat_interval(b as f64));
        let Some(interval) = interval else {
            emit(BeatState::Waiting);
            if !sleep_or_cancel(WAITING_POLL, &cancel).await {
                break;
            }
            continue;
        };

        emit(BeatState::Between);
        if !sleep_or_cancel(interval, &cancel).await {
            break;
        }
        emit(BeatState::Beat);
        if !sleep_or_cancel(settle, &cancel).await {
            break;
        }
    }
    emit(BeatState::Waiting);
    debug!("heartbeat: stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use parking_lot::Mutex;

    #[test]
    fn interval_matches_formula() {
        let d = beat_interval(60.2).unwrap();
        assert!((d.as_secs_f64() - 1.0).abs() < 1e-9);
        let d = beat_interval(120.0).unwrap();
        assert!((d.as_secs_f64() - 60.0 / 119.8).abs() < 1e-9);
    }

    #[test]
    fn degenerate_bpm_has_no_interval() {
        assert_eq!(beat_interval(0.0), None);
        assert_eq!(beat_interval(0.2), None);
        assert_eq!(beat_interval(0.1), None);
        assert_eq!(beat_interval(-5.0), None);
        assert_eq!(beat_interval(f64::NAN), None);
    }

    fn recorder() -> (Arc<Mutex<Vec<BeatState>>>, impl FnMut(BeatState) + Send) {
        let states = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&states);
        (states, move |s| sink.lock().push(s))
    }

    #[tokio::test(start_paused = true)]
    async fn zero_bpm_stays_waiting() {
        let (_tx, rx) = watch::channel(Some(0));
        let (states, emit) = recorder();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(rx, Duration::from_millis(100), cancel.clone(), emit));

        tokio::time::sleep(Duration::from_millis(3500)).await;
        cancel.cancel();
        task.await.unwrap();
        let states = states.lock();
        assert!(states.len() >= 4);
        assert!(states.iter().all(|s| *s == BeatState::Waiting));
    }

    #[tokio::test(start_paused = true)]
    async fn beats_follow_bpm() {
        let (tx, rx) = watch::channel(None::<u32>);
        let (states, emit) = recorder();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(rx, Duration::from_millis(100), cancel.clone(), emit));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(states.lock().as_slice(), &[BeatState::Waiting]);

        tx.send_replace(Some(120));
        // Waiting poll ends at 1 s, the beat lands 60/119.8 s later.
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(
            states.lock().as_slice(),
            &[BeatState::Waiting, BeatState::Between, BeatState::Beat]
        );

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(states.lock().last(), Some(&BeatState::Between));

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(states.lock().last(), Some(&BeatState::Waiting));
    }
}
