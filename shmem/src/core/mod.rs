use std::mem;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::debug;
use once_cell::sync::Lazy;
use serde_derive::{Deserialize, Serialize};
use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::flag;

use crate::errors::ShmemLibError;

pub mod event;
pub mod region;
pub mod semaphore;

/// Size of the whole shared region, header included.
pub const REGION_SIZE: usize = 8192;
/// Bytes available for a request or a response.
pub const PAYLOAD_CAPACITY: usize = REGION_SIZE - mem::size_of::<u64>();

pub const DEFAULT_DATA_DIR: &str = "/tmp";
pub const DEFAULT_REGION_FILE_NAME: &str = "shmem-handoff";
pub const DEFAULT_READY_SEMAPHORE: &str = "/shmem_handoff_ready";
pub const DEFAULT_DONE_SEMAPHORE: &str = "/shmem_handoff_done";

/// Layout of the region both processes map.
#[repr(C)]
pub struct SharedBuffer {
    pub size: u64,
    pub payload: [u8; PAYLOAD_CAPACITY],
}

const _: () = assert!(mem::size_of::<SharedBuffer>() == REGION_SIZE);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShmemConfig {
    pub data_dir: String,
    pub region_file_name: String,
    pub ready_semaphore: String,
    pub done_semaphore: String,
}

impl Default for ShmemConfig {
    fn default() -> Self {
        ShmemConfig {
            data_dir: DEFAULT_DATA_DIR.to_string(),
            region_file_name: DEFAULT_REGION_FILE_NAME.to_string(),
            ready_semaphore: DEFAULT_READY_SEMAPHORE.to_string(),
            done_semaphore: DEFAULT_DONE_SEMAPHORE.to_string(),
        }
    }
}

impl ShmemConfig {
    /// Path the re-exec worker receives as its only argument.
    pub fn region_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join(&self.region_file_name)
    }
}

/// Where a role stands in the request/response exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    RequestWritten,
    RequestVisible,
    ResponseWritten,
    ResponseVisible,
    Done,
}

impl Phase {
    #[inline]
    pub(crate) fn expect(self, allowed: &[Phase], operation: &str) -> Result<(), ShmemLibError> {
        if allowed.contains(&self) {
            Ok(())
        } else {
            Err(ShmemLibError::Logic(format!(
                "`{}` is not allowed in phase {:?} (expected one of {:?})",
                operation, self, allowed
            )))
        }
    }
}

/// One direction of the handshake.
///
/// `signal` releases at most one blocked `wait`. `wait` suspends the caller
/// without spinning until the matching `signal`. Neither provides memory
/// visibility on its own: writers publish before `signal`, readers subscribe
/// after `wait`.
pub trait HandshakeSignal {
    fn signal(&self) -> Result<(), ShmemLibError>;
    fn wait(&self) -> Result<(), ShmemLibError>;
}

/// The `ready` edge of the fork-only strategy.
///
/// The request is published before `fork(2)`, so the child starts with the
/// request already visible and nothing has to be signaled or awaited.
#[derive(Debug, Default, Clone, Copy)]
pub struct ForkEdge;

impl HandshakeSignal for ForkEdge {
    #[inline]
    fn signal(&self) -> Result<(), ShmemLibError> {
        Ok(())
    }

    #[inline]
    fn wait(&self) -> Result<(), ShmemLibError> {
        Ok(())
    }
}

const TERMINATION_SIGNALS: [libc::c_int; 4] = [SIGHUP, SIGINT, SIGQUIT, SIGTERM];

static TERMINATING: Lazy<Arc<AtomicBool>> = Lazy::new(|| Arc::new(AtomicBool::new(false)));

/// Records termination signals instead of dying on the first one, so a
/// blocked wait can return and named resources get released. A second
/// signal exits immediately with status 1.
pub fn install_termination_hooks() -> Result<(), ShmemLibError> {
    for &signal in TERMINATION_SIGNALS.iter() {
        flag::register_conditional_shutdown(signal, 1, Arc::clone(&*TERMINATING))?;
        flag::register(signal, Arc::clone(&*TERMINATING))?;
    }
    debug!("termination hooks installed for {:?}", TERMINATION_SIGNALS);
    Ok(())
}

#[inline]
pub fn termination_requested() -> bool {
    TERMINATING.load(Ordering::SeqCst)
}
