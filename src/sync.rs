//! Small synchronisation primitives shared by the lifecycle engine.

use anyhow::{anyhow, Result};
use std::future::Future;
use tokio::sync::{watch, Mutex};

/// A memoised fallible action.
///
/// The first caller runs the provided future; every later (or concurrent)
/// caller observes the recorded outcome instead of running again. Used for
/// the run-once and create-once guards of pods and containers.
#[derive(Debug, Default)]
pub struct OnceAction {
    outcome: Mutex<Option<std::result::Result<(), String>>>,
}

impl OnceAction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` if this action never ran, otherwise replay its outcome.
    pub async fn run<F, Fut>(&self, f: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut outcome = self.outcome.lock().await;
        match &*outcome {
            Some(Ok(())) => Ok(()),
            Some(Err(e)) => Err(anyhow!("{}", e)),
            None => {
                let res = f().await;
                *outcome = Some(match &res {
                    Ok(()) => Ok(()),
                    // anyhow chains do not clone; the replayed outcome keeps
                    // the formatted chain instead.
                    Err(e) => Err(format!("{:#}", e)),
                });
                res
            }
        }
    }

    /// True once the action ran, regardless of its outcome.
    pub async fn done(&self) -> bool {
        self.outcome.lock().await.is_some()
    }
}

/// A clonable cancellation handle.
///
/// Cancelling is idempotent and safe to invoke from multiple tasks; waiters
/// resolve once the first `cancel` lands.
#[derive(Clone, Debug)]
pub struct Cancel {
    tx: std::sync::Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Cancel {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: std::sync::Arc::new(tx),
            rx,
        }
    }

    /// Request cancellation. May be called any number of times.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_canceled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation was requested.
    pub async fn canceled(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for Cancel {
    fn default() -> Self {
        Self::new()
    }
}
