//! Cancellable linear value ramp

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Emits one value per `step`, moving linearly from `initial` to `target`.
///
/// Once `duration` has elapsed the target is emitted one last time and the
/// stream ends. Stopping (through [`LinearInterpolator::stop`], a handle, or
/// drop) ends the stream early.
#[derive(Debug)]
pub struct LinearInterpolator {
    rx: mpsc::Receiver<f32>,
    cancel: CancellationToken,
}

/// Stops the interpolator it was taken from
#[derive(Debug, Clone)]
pub struct InterpolatorHandle(CancellationToken);

impl InterpolatorHandle {
    pub fn stop(&self) {
        self.0.cancel();
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.0.is_cancelled()
    }
}

impl LinearInterpolator {
    #[must_use]
    pub fn new(initial: f32, target: f32, duration: Duration, step: Duration) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        tokio::spawn(async move {
            let start = Instant::now();
            let mut ticker = interval_at(start + step, step);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                let tick = tokio::select! {
                    () = token.cancelled() => break,
                    tick = ticker.tick() => tick,
                };

                let elapsed = tick.duration_since(start);
                let done = elapsed >= duration;
                let value = if done {
                    target
                } else {
                    let ratio = elapsed.as_secs_f32() / duration.as_secs_f32();
                    (target - initial).mul_add(ratio, initial)
                };

                tokio::select! {
                    () = token.cancelled() => break,
                    sent = tx.send(value) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }

                if done {
                    break;
                }
            }
        });

        Self { rx, cancel }
    }

    /// Next ramp value, `None` once finished or stopped
    pub async fn next(&mut self) -> Option<f32> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => None,
            value = self.rx.recv() => value,
        }
    }

    /// Stop ticking; harmless when already stopped
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn handle(&self) -> InterpolatorHandle {
        InterpolatorHandle(self.cancel.clone())
    }
}

impl Drop for LinearInterpolator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_near(a: f32, b: f32) -> bool {
        (a - b).abs() < 0.01
    }

    #[tokio::test(start_paused = true)]
    async fn test_emits_linear_ramp_then_closes() {
        let mut interpolator = LinearInterpolator::new(
            0.0,
            1.0,
            Duration::from_millis(300),
            Duration::from_millis(60),
        );

        let mut values = Vec::new();
        while let Some(value) = interpolator.next().await {
            values.push(value);
        }

        let expected = [0.2, 0.4, 0.6, 0.8, 1.0];
        assert_eq!(values.len(), expected.len(), "got {values:?}");
        for (got, want) in values.iter().zip(expected) {
            assert!(is_near(*got, want), "got {got} expected {want}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ramp_down() {
        let mut interpolator = LinearInterpolator::new(
            2.0,
            1.0,
            Duration::from_millis(100),
            Duration::from_millis(50),
        );
        assert!(is_near(interpolator.next().await.unwrap(), 1.5));
        assert!(is_near(interpolator.next().await.unwrap(), 1.0));
        assert_eq!(interpolator.next().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent() {
        let mut interpolator = LinearInterpolator::new(
            0.0,
            1.0,
            Duration::from_secs(1),
            Duration::from_millis(30),
        );
        assert!(interpolator.next().await.is_some());

        let handle = interpolator.handle();
        handle.stop();
        interpolator.stop();
        handle.stop();

        assert!(handle.is_stopped());
        assert_eq!(interpolator.next().await, None);
        assert_eq!(interpolator.next().await, None);
    }
}
