//! Notices when the reader of one of our output pipes goes away.
//!
//! A background thread polls a duplicate of the watched descriptor for
//! `POLLERR`/`POLLHUP` alongside the read end of a private control pipe.
//! Cancelling (or dropping) the watcher closes the control pipe's write end,
//! which wakes and ends the thread. The thread reports exactly one
//! [`PipeEvent`].

use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use tokio::sync::oneshot;
use tracing::debug;

/// How a watch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeEvent {
    /// The reader closed the watched pipe.
    Closed,
    /// The watch was cancelled first.
    Cancelled,
}

pub struct PipeWatcher {
    events: oneshot::Receiver<PipeEvent>,
    outcome: Option<PipeEvent>,
    // Closed to stop the thread.
    stop: Option<OwnedFd>,
}

impl PipeWatcher {
    pub fn new(fd: BorrowedFd<'_>) -> io::Result<Self> {
        let watched = fd.try_clone_to_owned()?;
        let (stop_rx, stop_tx) = nix::unistd::pipe()?;
        let (event_tx, event_rx) = oneshot::channel();

        std::thread::Builder::new()
            .name("pipe-watcher".to_string())
            .spawn(move || {
                let event = wait_for_close(&watched, &stop_rx);
                debug!(?event, "Pipe watch ended");
                let _ = event_tx.send(event);
            })?;

        Ok(Self {
            events: event_rx,
            outcome: None,
            stop: Some(stop_tx),
        })
    }

    /// Stop watching. A later [`PipeWatcher::wait`] reports
    /// [`PipeEvent::Cancelled`] unless the close was already seen.
    pub fn cancel(&mut self) {
        self.stop = None;
    }

    /// Resolves with the watch outcome; repeated calls return the same one.
    pub async fn wait(&mut self) -> PipeEvent {
        if let Some(event) = self.outcome {
            return event;
        }
        // A vanished thread never saw a close.
        let event = (&mut self.events).await.unwrap_or(PipeEvent::Cancelled);
        self.outcome = Some(event);
        event
    }

    /// Resolves only if the reader closes the pipe; pends forever once the
    /// watch has been cancelled.
    pub async fn closed(&mut self) {
        if self.wait().await == PipeEvent::Cancelled {
            std::future::pending::<()>().await;
        }
    }
}

fn wait_for_close(watched: &OwnedFd, stop: &OwnedFd) -> PipeEvent {
    loop {
        // No events requested on the watched fd: POLLERR and POLLHUP are
        // always reported, readiness never is.
        let mut fds = [
            PollFd::new(watched.as_fd(), PollFlags::empty()),
            PollFd::new(stop.as_fd(), PollFlags::POLLIN),
        ];
        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(_) => return PipeEvent::Cancelled,
        }
        // Cancellation wins a tie.
        if fds[1].revents().is_some_and(|r| !r.is_empty()) {
            return PipeEvent::Cancelled;
        }
        let closed = PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL;
        if fds[0].revents().is_some_and(|r| r.intersects(closed)) {
            return PipeEvent::Closed;
        }
    }
}
