//! Process sessions: bundle isolation and stale-runner cleanup.
//!
//! Each bundle runs as the leader of its own session so that everything it
//! forks, even processes that changed their process group, can be found and
//! signalled once the bundle is done.

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::{Pid, getpgid, getsid, setsid};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Rescans of `/proc` after signalling, for processes forked mid-sweep.
const MAX_KILL_SWEEPS: usize = 3;

/// Make the spawned child call `setsid()` before exec.
#[allow(unsafe_code)]
pub fn set_new_session(cmd: &mut tokio::process::Command) {
    // SAFETY: setsid is async-signal-safe and the closure touches no shared
    // state between fork and exec.
    unsafe {
        cmd.pre_exec(|| setsid().map(|_| ()).map_err(std::io::Error::from));
    }
}

/// Signal every live process in session `sid`. Returns how many were signalled.
pub fn kill_session(sid: Pid, signal: Signal) -> usize {
    let mut signalled = HashSet::new();
    for sweep in 0..MAX_KILL_SWEEPS {
        let members = session_members(sid);
        if members.is_empty() {
            break;
        }
        for pid in &members {
            match kill(*pid, signal) {
                Ok(()) => {
                    signalled.insert(*pid);
                }
                Err(Errno::ESRCH) => {}
                Err(e) => warn!(pid = pid.as_raw(), "Failed to signal session member: {e}"),
            }
        }
        debug!(sid = sid.as_raw(), sweep, signalled = members.len(), "Swept session");
    }
    signalled.len()
}

/// Non-zombie processes whose session id is `sid`, excluding ourselves.
pub fn session_members(sid: Pid) -> Vec<Pid> {
    let me = Pid::this();
    proc_pids()
        .into_iter()
        .filter(|pid| *pid != me)
        .filter(|pid| getsid(Some(*pid)).is_ok_and(|s| s == sid))
        .filter(|pid| !is_zombie(*pid))
        .collect()
}

/// Kills the session when dropped unless [`SessionGuard::kill`] ran first.
pub struct SessionGuard {
    sid: Pid,
    armed: bool,
}

impl SessionGuard {
    pub fn new(sid: Pid) -> Self {
        Self { sid, armed: true }
    }

    /// Kill the session off the async runtime's worker threads.
    pub async fn kill(mut self) {
        self.armed = false;
        let sid = self.sid;
        let killed = tokio::task::spawn_blocking(move || kill_session(sid, Signal::SIGKILL))
            .await
            .unwrap_or_default();
        if killed > 0 {
            debug!(sid = sid.as_raw(), killed, "Killed leftover bundle processes");
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.armed {
            kill_session(self.sid, Signal::SIGKILL);
        }
    }
}

/// SIGTERM the process group of every other process running our executable.
pub fn kill_stale_runners() -> usize {
    match std::env::current_exe() {
        Ok(exe) => kill_stale_runners_for(&exe),
        Err(e) => {
            warn!("Cannot resolve own executable; not killing stale runners: {e}");
            0
        }
    }
}

/// SIGTERM the process group of every other process whose executable is
/// `exe`, skipping our own group. Returns how many groups were signalled.
pub fn kill_stale_runners_for(exe: &Path) -> usize {
    let exe = exe.canonicalize().unwrap_or_else(|_| exe.to_path_buf());
    let me = Pid::this();
    let my_pgid = getpgid(None).ok();

    let mut killed = 0;
    for pid in proc_pids() {
        if pid == me || exe_of(pid).as_deref() != Some(exe.as_path()) {
            continue;
        }
        let Ok(pgid) = getpgid(Some(pid)) else {
            continue;
        };
        if Some(pgid) == my_pgid {
            warn!(pid = pid.as_raw(), "Stale runner shares our process group; skipping");
            continue;
        }
        match killpg(pgid, Signal::SIGTERM) {
            Ok(()) => {
                info!(pid = pid.as_raw(), pgid = pgid.as_raw(), "Terminated stale runner");
                killed += 1;
            }
            Err(e) => warn!(pid = pid.as_raw(), "Failed to terminate stale runner: {e}"),
        }
    }
    killed
}

fn proc_pids() -> Vec<Pid> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    entries
        .filter_map(Result::ok)
        .filter_map(|e| e.file_name().to_str()?.parse::<i32>().ok())
        .map(Pid::from_raw)
        .collect()
}

fn exe_of(pid: Pid) -> Option<PathBuf> {
    std::fs::read_link(Path::new("/proc").join(pid.as_raw().to_string()).join("exe")).ok()
}

// Field 3 of /proc/<pid>/stat, after the parenthesized command name.
fn is_zombie(pid: Pid) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid.as_raw())) else {
        return false;
    };
    stat.rsplit_once(')')
        .and_then(|(_, rest)| rest.split_whitespace().next())
        .is_some_and(|state| state == "Z" || state == "X")
}
