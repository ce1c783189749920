//! Ways of materializing the worker process.
//!
//! Every strategy honours the same contract: run one request through a
//! [`WorkerBody`](crate::compute::WorkerBody) in a second process that shares
//! memory with this one, and release every resource before returning.

use std::fmt;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::{Child, ExitStatus};
use std::str::FromStr;

use log::{debug, warn};
use serde_derive::{Deserialize, Serialize};

use crate::errors::ShmemLibError;

mod fork;
mod reexec;

pub use fork::ForkLauncher;
pub use reexec::ReexecLauncher;

pub trait Launcher {
    fn round_trip(&self, request: &[u8]) -> Result<Vec<u8>, ShmemLibError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Spawn the worker program, which re-opens the region and semaphores by name.
    Reexec,
    /// Fork and run the worker body in the child on inherited handles.
    Fork,
}

impl Default for Strategy {
    fn default() -> Self {
        Strategy::Reexec
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reexec" => Ok(Strategy::Reexec),
            "fork" => Ok(Strategy::Fork),
            other => Err(format!("unknown strategy `{}` (expected `reexec` or `fork`)", other)),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Reexec => write!(f, "reexec"),
            Strategy::Fork => write!(f, "fork"),
        }
    }
}

enum Spawned {
    Command(Child),
    Forked(libc::pid_t),
}

/// A running worker. Dropping it without [`WorkerProcess::reap`] terminates
/// and reaps the process, so shared resources are never destroyed under a
/// live peer.
pub(crate) struct WorkerProcess {
    spawned: Option<Spawned>,
}

impl WorkerProcess {
    pub(crate) fn command(child: Child) -> WorkerProcess {
        WorkerProcess { spawned: Some(Spawned::Command(child)) }
    }

    pub(crate) fn forked(pid: libc::pid_t) -> WorkerProcess {
        WorkerProcess { spawned: Some(Spawned::Forked(pid)) }
    }

    /// Waits for the worker to exit.
    pub(crate) fn reap(mut self) -> Result<ExitStatus, ShmemLibError> {
        let status = match self.spawned.take() {
            Some(spawned) => wait_for(spawned)?,
            None => return Err(ShmemLibError::Logic("worker already reaped".to_string())),
        };
        if status.success() {
            debug!("worker exited: {}", status);
        } else {
            warn!("worker exited abnormally after answering: {}", status);
        }
        Ok(status)
    }
}

fn wait_for(spawned: Spawned) -> Result<ExitStatus, ShmemLibError> {
    match spawned {
        Spawned::Command(mut child) => Ok(child.wait()?),
        Spawned::Forked(pid) => {
            let mut status: libc::c_int = 0;
            loop {
                if unsafe { libc::waitpid(pid, &mut status, 0) } == pid {
                    return Ok(ExitStatus::from_raw(status));
                }
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::EINTR) {
                    return Err(ShmemLibError::Io(err));
                }
            }
        }
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        let spawned = match self.spawned.take() {
            Some(spawned) => spawned,
            None => return,
        };
        let spawned = match spawned {
            Spawned::Command(mut child) => {
                if let Err(e) = child.kill() {
                    warn!("failed to terminate worker {}: {}", child.id(), e);
                }
                Spawned::Command(child)
            }
            Spawned::Forked(pid) => {
                if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
                    warn!("failed to terminate worker {}: {}", pid, io::Error::last_os_error());
                }
                Spawned::Forked(pid)
            }
        };
        match wait_for(spawned) {
            Ok(status) => debug!("terminated worker reaped: {}", status),
            Err(e) => warn!("failed to reap terminated worker: {}", e),
        }
    }
}
