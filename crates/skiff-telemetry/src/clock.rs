//! Boundary-aligned timer that forces rotation during idle periods

use crate::rotation::interval_start;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use skiff_core::RotationFrequency;
use std::ops::ControlFlow;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// First hour or minute boundary strictly after `now`
pub fn next_boundary(frequency: RotationFrequency, now: DateTime<Utc>) -> DateTime<Utc> {
    interval_start(frequency, now) + period(frequency)
}

fn period(frequency: RotationFrequency) -> ChronoDuration {
    ChronoDuration::seconds(frequency.period().as_secs() as i64)
}

/// Calls back on every rotation boundary until stopped.
///
/// The callback receives the boundary it was scheduled for; boundaries are
/// strictly increasing even if the wall clock has not quite reached the next
/// one when the timer fires. Dropping the clock stops it.
#[derive(Debug)]
pub struct LifecycleClock {
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl LifecycleClock {
    /// Spawn the timer task. Must be called inside a tokio runtime.
    pub fn start<F>(frequency: RotationFrequency, mut on_tick: F) -> Self
    where
        F: FnMut(DateTime<Utc>) -> ControlFlow<()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let cancelled = token.clone();

        let handle = tokio::spawn(async move {
            let mut previous: Option<DateTime<Utc>> = None;

            loop {
                let now = Utc::now();
                let mut boundary = next_boundary(frequency, now);
                if let Some(previous) = previous {
                    if boundary <= previous {
                        boundary = previous + period(frequency);
                    }
                }
                let wait = (boundary - now).to_std().unwrap_or(Duration::ZERO);

                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }

                previous = Some(boundary);
                if on_tick(boundary).is_break() {
                    break;
                }
            }
        });

        Self {
            token,
            handle: Some(handle),
        }
    }

    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
            || self
                .handle
                .as_ref()
                .map(|handle| handle.is_finished())
                .unwrap_or(true)
    }

    /// Wait for the timer task to exit
    pub async fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for LifecycleClock {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
