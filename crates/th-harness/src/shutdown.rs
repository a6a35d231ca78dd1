use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// StopToken: per-component cancellation
// ---------------------------------------------------------------------------

/// Level-triggered cancellation flag.
///
/// Unlike a broadcast, a token stopped before anyone waits on it is still
/// observed: `stopped()` returns immediately. Clones share the flag.
#[derive(Debug, Clone)]
pub struct StopToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl StopToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Request a stop. Idempotent.
    pub fn stop(&self) {
        self.tx.send_if_modified(|stopped| !std::mem::replace(stopped, true));
    }

    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once [`stop`](Self::stop) has been called.
    pub async fn stopped(&self) {
        let mut rx = self.rx.clone();
        // The sender lives as long as `self`, so this only returns on stop.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Sleep for `duration` unless stopped first. Returns `true` when the
    /// full duration elapsed and `false` when the sleep was cut short.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if self.is_stopped() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.stopped() => false,
        }
    }
}

impl Default for StopToken {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// ShutdownSignal: process-wide shutdown with drain accounting
// ---------------------------------------------------------------------------

/// Process-wide shutdown coordinator.
///
/// Long-running components take a [`StopToken`] from
/// [`subscribe`](Self::subscribe) and a [`ShutdownGuard`]; the owner calls
/// [`trigger`](Self::trigger) and then [`wait_for_drain`](Self::wait_for_drain)
/// to give them a bounded grace period.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    token: StopToken,
    drained_tx: Arc<watch::Sender<usize>>,
    drained: watch::Receiver<usize>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (drained_tx, drained) = watch::channel(0);
        Self {
            token: StopToken::new(),
            drained_tx: Arc::new(drained_tx),
            drained,
        }
    }

    /// A token that is stopped when shutdown is triggered.
    pub fn subscribe(&self) -> StopToken {
        self.token.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_stopped()
    }

    pub fn trigger(&self) {
        if self.token.is_stopped() {
            debug!("shutdown requested again; ignoring");
            return;
        }
        info!("shutdown requested");
        self.token.stop();
    }

    /// Count one component as drained. Usually called by [`ShutdownGuard`].
    pub fn confirm_drained(&self) {
        self.drained_tx.send_modify(|n| *n += 1);
    }

    /// Wait until `expected` components have drained or `timeout` passes.
    pub async fn wait_for_drain(&self, expected: usize, timeout: Duration) -> DrainResult {
        let mut drained = self.drained.clone();
        let reached = tokio::time::timeout(timeout, drained.wait_for(|n| *n >= expected))
            .await
            .is_ok();
        let confirmed = *self.drained.borrow();
        if reached {
            info!(confirmed, "background components drained");
            DrainResult::Complete(confirmed)
        } else {
            warn!(confirmed, expected, "grace period ran out before every component drained");
            DrainResult::Timeout {
                confirmed,
                expected,
            }
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainResult {
    Complete(usize),
    Timeout { confirmed: usize, expected: usize },
}

impl DrainResult {
    pub fn is_complete(&self) -> bool {
        matches!(self, DrainResult::Complete(_))
    }
}

/// Confirms drain on the owning [`ShutdownSignal`] when dropped.
pub struct ShutdownGuard {
    signal: ShutdownSignal,
}

impl ShutdownGuard {
    pub fn new(signal: ShutdownSignal) -> Self {
        Self { signal }
    }
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.signal.confirm_drained();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stop_before_wait_is_observed() {
        let token = StopToken::new();
        token.stop();
        tokio::time::timeout(Duration::from_millis(100), token.stopped())
            .await
            .expect("stopped() should resolve immediately");
    }

    #[tokio::test]
    async fn sleep_is_cut_short_by_stop() {
        let token = StopToken::new();
        let sleeper = token.clone();
        let handle = tokio::spawn(async move { sleeper.sleep(Duration::from_secs(60)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.stop();
        let completed = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(!completed);
    }

    #[tokio::test]
    async fn sleep_runs_to_completion_without_stop() {
        let token = StopToken::new();
        assert!(token.sleep(Duration::from_millis(5)).await);
    }

    #[test]
    fn repeated_trigger_is_harmless() {
        let signal = ShutdownSignal::new();
        signal.trigger();
        signal.trigger();
        assert!(signal.is_shutting_down());
        assert!(signal.subscribe().is_stopped());
    }

    #[tokio::test]
    async fn drain_completes_when_all_guards_drop() {
        let signal = ShutdownSignal::new();
        for _ in 0..2 {
            let guard = ShutdownGuard::new(signal.clone());
            let stop = signal.subscribe();
            tokio::spawn(async move {
                let _guard = guard;
                stop.stopped().await;
            });
        }
        signal.trigger();

        let result = signal.wait_for_drain(2, Duration::from_secs(1)).await;
        assert_eq!(result, DrainResult::Complete(2));
    }

    #[tokio::test]
    async fn drain_times_out_when_a_guard_is_held() {
        let signal = ShutdownSignal::new();
        let _guard = ShutdownGuard::new(signal.clone());
        signal.trigger();

        let result = signal.wait_for_drain(1, Duration::from_millis(30)).await;
        assert_eq!(
            result,
            DrainResult::Timeout {
                confirmed: 0,
                expected: 1
            }
        );
    }
}
