//! Running one bundle executable for one request.

use crate::pipe_watcher::PipeWatcher;
use crate::session::{SessionGuard, set_new_session};
use crate::shutdown::{Shutdown, ShutdownSignal};
use harness_common::{BundleRequest, ProtocolError};
use nix::unistd::Pid;
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Upper bound on captured bundle stderr kept for error messages.
const MAX_STDERR_BYTES: usize = 64 * 1024;

/// How long output may keep flowing after the bundle's session was killed.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("failed to start bundle {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O with bundle {path} failed: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("bundle {path} {}: {stderr}", describe_exit(*.code))]
    Exited {
        path: PathBuf,
        code: Option<i32>,
        stderr: String,
    },

    #[error("interrupted")]
    Interrupted,

    #[error("terminated by signal")]
    Terminated,

    #[error("bad output from bundle {path}: {source}")]
    Protocol {
        path: PathBuf,
        #[source]
        source: ProtocolError,
    },
}

fn describe_exit(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exited with status {code}"),
        None => "was killed by a signal".to_string(),
    }
}

/// Run `path` with `args`, send it `request`, and forward each stdout line
/// to `lines`.
///
/// The bundle gets its own session. Once the bundle itself exits, every
/// process left in that session is killed and the remaining output drained.
/// A shutdown signal or our own stdout reader going away abort the bundle
/// early.
pub async fn run_bundle(
    path: &Path,
    args: &[String],
    request: &BundleRequest,
    lines: mpsc::Sender<String>,
    shutdown: &Shutdown,
) -> Result<(), BundleError> {
    let io_err = |source: std::io::Error| BundleError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut input = serde_json::to_vec(request).map_err(|e| BundleError::Protocol {
        path: path.to_path_buf(),
        source: ProtocolError::Encode(e),
    })?;
    input.push(b'\n');

    let mut watcher = match PipeWatcher::new(std::io::stdout().as_fd()) {
        Ok(w) => Some(w),
        Err(e) => {
            warn!("Cannot watch stdout for a closed reader: {e}");
            None
        }
    };

    let mut cmd = Command::new(path);
    cmd.args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    set_new_session(&mut cmd);

    let mut child = cmd.spawn().map_err(|source| BundleError::Spawn {
        path: path.to_path_buf(),
        source,
    })?;
    let guard = child
        .id()
        .map(|pid| SessionGuard::new(Pid::from_raw(pid as i32)));
    debug!(bundle = %path.display(), pid = child.id(), "Started bundle");

    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let mut tasks: JoinSet<std::io::Result<Option<String>>> = JoinSet::new();
    tasks.spawn(async move {
        if let Some(mut stdin) = stdin {
            match stdin.write_all(&input).await {
                // The bundle may legitimately exit without reading.
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
                other => other?,
            }
        }
        Ok::<_, std::io::Error>(None)
    });
    tasks.spawn(async move {
        if let Some(stdout) = stdout {
            let mut reader = BufReader::new(stdout).lines();
            while let Some(line) = reader.next_line().await? {
                if lines.send(line).await.is_err() {
                    break;
                }
            }
        }
        Ok::<_, std::io::Error>(None)
    });
    tasks.spawn(async move {
        match stderr {
            Some(stderr) => capture_stderr(stderr).await.map(Some),
            None => Ok(None),
        }
    });

    let exited = tokio::select! {
        res = child.wait() => res.map_err(io_err),
        _ = stdout_closed(&mut watcher) => Err(BundleError::Interrupted),
        sig = shutdown.signalled() => Err(match sig {
            ShutdownSignal::Interrupt => BundleError::Interrupted,
            ShutdownSignal::Terminate => BundleError::Terminated,
        }),
    };
    if let Some(w) = watcher.as_mut() {
        w.cancel();
    }

    // Descendants may still hold the output pipes open.
    if let Some(guard) = guard {
        guard.kill().await;
    }

    let outcome = match exited {
        Ok(status) => match drain(&mut tasks).await {
            Err(source) => Err(io_err(source)),
            Ok(_) if status.success() => Ok(()),
            Ok(stderr) => Err(BundleError::Exited {
                path: path.to_path_buf(),
                code: status.code(),
                stderr,
            }),
        },
        Err(e) => Err(e),
    };
    tasks.abort_all();
    debug!(bundle = %path.display(), ok = outcome.is_ok(), "Bundle finished");
    outcome
}

// Keeps the first MAX_STDERR_BYTES and discards the rest, reading to EOF so
// the bundle never sees a broken stderr pipe.
async fn capture_stderr<R: AsyncRead + Unpin>(mut stderr: R) -> std::io::Result<String> {
    let mut kept = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = stderr.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        let room = MAX_STDERR_BYTES.saturating_sub(kept.len());
        kept.extend_from_slice(&chunk[..n.min(room)]);
    }
    Ok(String::from_utf8_lossy(&kept).trim_end().to_string())
}

// Waits for the stdin/stdout/stderr tasks; yields captured stderr.
async fn drain(tasks: &mut JoinSet<std::io::Result<Option<String>>>) -> std::io::Result<String> {
    let all = async {
        let mut stderr = String::new();
        while let Some(joined) = tasks.join_next().await {
            if let Some(captured) = joined.map_err(std::io::Error::other)?? {
                stderr = captured;
            }
        }
        Ok::<_, std::io::Error>(stderr)
    };
    match tokio::time::timeout(DRAIN_TIMEOUT, all).await {
        Ok(res) => res,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "bundle output still open after its session was killed",
        )),
    }
}

async fn stdout_closed(watcher: &mut Option<PipeWatcher>) {
    match watcher {
        Some(w) => w.closed().await,
        None => std::future::pending().await,
    }
}
