//! Process-wide SIGINT/SIGTERM handling.
//!
//! Handlers are installed once at startup and record the most recent signal
//! in a watch channel. Work that can be aborted waits on [`Shutdown::signalled`];
//! a signal that arrives while nothing is waiting is still seen by the next
//! waiter.

use std::io;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

#[derive(Clone)]
pub struct Shutdown {
    rx: watch::Receiver<Option<ShutdownSignal>>,
}

impl Shutdown {
    /// Install SIGINT and SIGTERM handlers. Needs a running tokio runtime.
    pub fn install() -> io::Result<Self> {
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let (tx, shutdown) = Self::channel();
        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    Some(()) = sigint.recv() => ShutdownSignal::Interrupt,
                    Some(()) = sigterm.recv() => ShutdownSignal::Terminate,
                    else => break,
                };
                info!(signal = ?received, "Shutdown requested");
                tx.send_replace(Some(received));
            }
        });
        Ok(shutdown)
    }

    /// A handle driven by the returned sender instead of real signals.
    pub fn channel() -> (watch::Sender<Option<ShutdownSignal>>, Self) {
        let (tx, rx) = watch::channel(None);
        (tx, Self { rx })
    }

    /// A handle that never fires.
    pub fn never() -> Self {
        Self::channel().1
    }

    /// Resolves with the first signal seen, immediately if one already arrived.
    pub async fn signalled(&self) -> ShutdownSignal {
        let mut rx = self.rx.clone();
        let received = match rx.wait_for(Option::is_some).await {
            Ok(value) => *value,
            Err(_) => None,
        };
        match received {
            Some(sig) => sig,
            None => std::future::pending().await,
        }
    }
}
