//! Pipeline-wide pause after systemic target failures.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::retry::backoff_delay;

/// Shared by every worker. A systemic failure on any partition holds all
/// workers before their next apply; the hold doubles with each consecutive
/// systemic failure and clears on the first successful apply.
pub struct PauseGate {
    base: Duration,
    max: Duration,
    consecutive: AtomicU32,
    until: watch::Sender<Option<Instant>>,
}

impl PauseGate {
    pub fn new(base: Duration, max: Duration) -> Self {
        let (until, _) = watch::channel(None);
        Self {
            base,
            max,
            consecutive: AtomicU32::new(0),
            until,
        }
    }

    /// Register a systemic failure and return the resulting pause.
    pub fn trip(&self, reason: &str) -> Duration {
        let failures = self.consecutive.fetch_add(1, Ordering::SeqCst) + 1;
        let pause = backoff_delay(self.base, self.max, failures);
        let until = Instant::now() + pause;
        self.until.send_if_modified(|current| match current {
            Some(existing) if *existing >= until => false,
            _ => {
                *current = Some(until);
                true
            }
        });
        tracing::warn!(
            "Target unavailable ({reason}); pausing all partitions for {:?} (systemic failure #{failures})",
            pause
        );
        pause
    }

    /// Clear the pause after a successful apply.
    pub fn reset(&self) {
        if self.consecutive.swap(0, Ordering::SeqCst) > 0 {
            self.until.send_replace(None);
            tracing::info!("Target reachable again; resuming all partitions");
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        matches!(*self.until.borrow(), Some(until) if until > Instant::now())
    }

    /// Wait until no pause is in effect.
    pub async fn wait(&self) {
        let mut rx = self.until.subscribe();
        loop {
            let until = *rx.borrow_and_update();
            let Some(until) = until else {
                return;
            };
            if until <= Instant::now() {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep_until(until) => return,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }
}
