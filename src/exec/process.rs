//! Cancellable processes
//!
//! A step runs as a [`Process`]: a spawned task with a signal path, a ready
//! gate and a memoized terminal result. Signals are advisory; the process
//! decides how to react and its result is only available once it returns.

use crate::error::{GantryError, GantryResult};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

/// Signal delivered to a running process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    /// Polite cancellation (Ctrl-C)
    Interrupt,
    /// Request to terminate
    Terminate,
    /// Immediate kill
    Kill,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interrupt => write!(f, "interrupt"),
            Self::Terminate => write!(f, "terminate"),
            Self::Kill => write!(f, "kill"),
        }
    }
}

/// Receiving end of a process's signal channel
pub type Signals = mpsc::UnboundedReceiver<Signal>;

/// Sending end of a process's signal channel
pub type SignalSender = mpsc::UnboundedSender<Signal>;

/// Create a signal channel
pub fn signal_channel() -> (SignalSender, Signals) {
    mpsc::unbounded_channel()
}

/// Ready gate raised by a runnable once it has initialized
///
/// Firing is idempotent; dropping an unfired gate tells the waiter the
/// runnable finished without ever becoming ready.
#[derive(Debug)]
pub struct Ready {
    tx: Option<oneshot::Sender<()>>,
}

impl Ready {
    /// Create a ready gate and the receiver that observes it
    pub fn channel() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Raise the gate
    pub fn fire(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }

    /// Whether the gate has been raised
    pub fn is_fired(&self) -> bool {
        self.tx.is_none()
    }
}

/// Something that can run as a cancellable process
#[async_trait]
pub trait Runnable: Send + Sync {
    /// Run to completion, raising `ready` once initialized and reacting to
    /// `signals` as the implementation sees fit
    async fn run(&self, signals: Signals, ready: Ready) -> GantryResult<()>;
}

/// Handle to a spawned runnable
///
/// `wait` may be called any number of times, from any number of clones;
/// every caller observes the same terminal result.
#[derive(Clone)]
pub struct Process {
    signals: SignalSender,
    ready: watch::Receiver<bool>,
    done: watch::Receiver<Option<GantryResult<()>>>,
}

impl Process {
    /// Spawn `runnable` on the tokio runtime
    pub fn invoke<R: Runnable + ?Sized + 'static>(runnable: Arc<R>) -> Self {
        let (signal_tx, signal_rx) = signal_channel();
        let (ready_gate, ready_rx) = Ready::channel();
        let (ready_tx, ready) = watch::channel(false);
        let (done_tx, done) = watch::channel(None);

        tokio::spawn(async move {
            if ready_rx.await.is_ok() {
                let _ = ready_tx.send(true);
            }
        });

        tokio::spawn(async move {
            let result = runnable.run(signal_rx, ready_gate).await;
            debug!("Process exited: {:?}", result.as_ref().err());
            let _ = done_tx.send(Some(result));
        });

        Self {
            signals: signal_tx,
            ready,
            done,
        }
    }

    /// Deliver a signal; ignored once the process has exited
    pub fn signal(&self, signal: Signal) {
        if self.signals.send(signal).is_err() {
            debug!("Dropping {} signal for exited process", signal);
        }
    }

    /// Wait until the process is ready or has exited, whichever comes first
    pub async fn ready(&self) {
        let mut ready = self.ready.clone();
        let mut done = self.done.clone();
        tokio::select! {
            _ = ready.wait_for(|r| *r) => {}
            _ = done.wait_for(|d| d.is_some()) => {}
        }
    }

    /// Wait for the terminal result
    pub async fn wait(&self) -> GantryResult<()> {
        let mut done = self.done.clone();
        let result = done
            .wait_for(|d| d.is_some())
            .await
            .map_err(|_| GantryError::Internal("process task dropped its result".to_string()))?;
        match &*result {
            Some(result) => result.clone(),
            None => Err(GantryError::Internal("process exited without a result".to_string())),
        }
    }

    /// Terminal result if the process has already exited
    pub fn try_wait(&self) -> Option<GantryResult<()>> {
        self.done.borrow().clone()
    }
}
