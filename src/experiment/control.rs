//! Run control signals and cancellable waits.
//!
//! The host side holds a [`RunControl`] and flips a single watch value between
//! `Run`, `Pause` and `Abort`. The worker side holds a [`ControlReceiver`] and
//! observes that value at every suspension point: polling waits, settling
//! delays, inter-sample delays and retry backoffs all go through
//! [`ControlReceiver::sleep`], so a pause or abort is noticed immediately
//! rather than after the current wait elapses.
//!
//! Adapter calls themselves are wrapped in [`ControlReceiver::guard`], which
//! only reacts to `Abort`. A pause lets the in-flight call finish and is
//! honoured at the next suspension point.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// The value shared between host and worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlSignal {
    Run,
    Pause,
    Abort(String),
}

/// Why a worker-side wait returned early.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interrupt {
    Pause,
    Abort(String),
}

impl fmt::Display for Interrupt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interrupt::Pause => f.write_str("paused"),
            Interrupt::Abort(reason) => write!(f, "aborted: {reason}"),
        }
    }
}

const CHANNEL_CLOSED: &str = "run control dropped";

/// Creates a connected control pair in the `Run` state.
pub fn channel() -> (RunControl, ControlReceiver) {
    let (tx, rx) = watch::channel(ControlSignal::Run);
    (RunControl { tx: Arc::new(tx) }, ControlReceiver { rx })
}

/// Host-side handle.
#[derive(Debug, Clone)]
pub struct RunControl {
    tx: Arc<watch::Sender<ControlSignal>>,
}

impl RunControl {
    /// Requests a pause. Returns `false` if the run is not currently running.
    pub fn pause(&self) -> bool {
        self.tx.send_if_modified(|signal| {
            if *signal == ControlSignal::Run {
                *signal = ControlSignal::Pause;
                true
            } else {
                false
            }
        })
    }

    /// Releases a pause. Returns `false` if the run was not paused.
    pub fn resume(&self) -> bool {
        self.tx.send_if_modified(|signal| {
            if *signal == ControlSignal::Pause {
                *signal = ControlSignal::Run;
                true
            } else {
                false
            }
        })
    }

    /// Requests an abort. Only the first request is recorded; later calls
    /// return `false` and leave the original reason in place.
    pub fn abort(&self, reason: &str) -> bool {
        self.tx.send_if_modified(|signal| {
            if matches!(signal, ControlSignal::Abort(_)) {
                false
            } else {
                *signal = ControlSignal::Abort(reason.to_string());
                true
            }
        })
    }

    pub fn current(&self) -> ControlSignal {
        self.tx.borrow().clone()
    }
}

/// Worker-side handle.
#[derive(Debug)]
pub struct ControlReceiver {
    rx: watch::Receiver<ControlSignal>,
}

impl ControlReceiver {
    /// Fails with the pending interrupt, if any.
    pub fn check(&self) -> Result<(), Interrupt> {
        match &*self.rx.borrow() {
            ControlSignal::Run => Ok(()),
            ControlSignal::Pause => Err(Interrupt::Pause),
            ControlSignal::Abort(reason) => Err(Interrupt::Abort(reason.clone())),
        }
    }

    /// Like [`check`](Self::check) but ignores a pending pause.
    pub fn check_abort(&self) -> Result<(), Interrupt> {
        match &*self.rx.borrow() {
            ControlSignal::Abort(reason) => Err(Interrupt::Abort(reason.clone())),
            _ => Ok(()),
        }
    }

    /// The abort reason, if an abort has been requested.
    pub fn abort_reason(&self) -> Option<String> {
        match &*self.rx.borrow() {
            ControlSignal::Abort(reason) => Some(reason.clone()),
            _ => None,
        }
    }

    /// Sleeps for `duration` unless paused or aborted first.
    pub async fn sleep(&mut self, duration: Duration) -> Result<(), Interrupt> {
        self.check()?;
        let sleep = tokio::time::sleep(duration);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return Ok(()),
                changed = self.rx.changed() => {
                    if changed.is_err() {
                        return Err(Interrupt::Abort(CHANNEL_CLOSED.to_string()));
                    }
                    self.check()?;
                }
            }
        }
    }

    /// Drives `fut` to completion unless an abort arrives first.
    pub async fn guard<F>(&mut self, fut: F) -> Result<F::Output, Interrupt>
    where
        F: Future,
    {
        self.check_abort()?;
        tokio::pin!(fut);
        loop {
            tokio::select! {
                biased;
                out = &mut fut => return Ok(out),
                changed = self.rx.changed() => {
                    if changed.is_err() {
                        return Err(Interrupt::Abort(CHANNEL_CLOSED.to_string()));
                    }
                    self.check_abort()?;
                }
            }
        }
    }

    /// Waits while paused. Returns once running again, or fails on abort.
    pub async fn resumed(&mut self) -> Result<(), Interrupt> {
        loop {
            let signal = self.rx.borrow_and_update().clone();
            match signal {
                ControlSignal::Run => return Ok(()),
                ControlSignal::Abort(reason) => return Err(Interrupt::Abort(reason)),
                ControlSignal::Pause => {}
            }
            if self.rx.changed().await.is_err() {
                return Err(Interrupt::Abort(CHANNEL_CLOSED.to_string()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        let (control, rx) = channel();
        assert!(rx.check().is_ok());

        assert!(control.pause());
        assert!(!control.pause());
        assert_eq!(rx.check(), Err(Interrupt::Pause));
        assert!(rx.check_abort().is_ok());

        assert!(control.resume());
        assert!(!control.resume());
        assert!(rx.check().is_ok());
    }

    #[test]
    fn test_abort_is_idempotent() {
        let (control, rx) = channel();
        assert!(control.abort("operator"));
        assert!(!control.abort("again"));
        assert!(!control.pause());
        assert_eq!(rx.check(), Err(Interrupt::Abort("operator".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_is_interrupted_by_abort() {
        let (control, mut rx) = channel();
        let start = tokio::time::Instant::now();
        let handle = tokio::spawn(async move { rx.sleep(Duration::from_secs(60)).await });

        tokio::time::sleep(Duration::from_secs(1)).await;
        control.abort("stop");
        let result = handle.await.unwrap();

        assert_eq!(result, Err(Interrupt::Abort("stop".to_string())));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_guard_ignores_pause() {
        let (control, mut rx) = channel();
        let handle = tokio::spawn(async move {
            rx.guard(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                42
            })
            .await
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        control.pause();
        assert_eq!(handle.await.unwrap(), Ok(42));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resumed_waits_for_resume() {
        let (control, mut rx) = channel();
        control.pause();
        let handle = tokio::spawn(async move { rx.resumed().await });

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!handle.is_finished());
        control.resume();
        assert_eq!(handle.await.unwrap(), Ok(()));
    }
}
