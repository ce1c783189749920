use std::env;
use std::path::PathBuf;
use std::process::Command;

use log::{debug, info};

use super::{Launcher, WorkerProcess};
use crate::core::region::SharedRegion;
use crate::core::semaphore::HandshakeSemaphorePair;
use crate::core::{ShmemConfig, REGION_SIZE};
use crate::errors::ShmemLibError;
use crate::producer::Producer;
use crate::worker::{DONE_SEMAPHORE_ENV, READY_SEMAPHORE_ENV};

/// Spawns a separate worker program that re-opens the region by path and
/// the semaphores by name.
pub struct ReexecLauncher {
    shmem: ShmemConfig,
    worker_program: PathBuf,
}

impl ReexecLauncher {
    pub fn new<P: Into<PathBuf>>(shmem: ShmemConfig, worker_program: P) -> ReexecLauncher {
        ReexecLauncher { shmem, worker_program: worker_program.into() }
    }

    /// The `worker` executable installed next to the running one.
    pub fn sibling_worker_program() -> Result<PathBuf, ShmemLibError> {
        Ok(env::current_exe()?.with_file_name("worker"))
    }

    pub fn worker_program(&self) -> &PathBuf {
        &self.worker_program
    }
}

impl Launcher for ReexecLauncher {
    fn round_trip(&self, request: &[u8]) -> Result<Vec<u8>, ShmemLibError> {
        let path = self.shmem.region_path();

        // Locals drop in reverse order, so any early return below releases the
        // worker, then the region, then the semaphores.
        let semaphores = HandshakeSemaphorePair::create(&self.shmem.ready_semaphore, &self.shmem.done_semaphore)?;
        let region = SharedRegion::create_linked(&path, REGION_SIZE)?;
        let child = Command::new(&self.worker_program)
            .arg(&path)
            .env(READY_SEMAPHORE_ENV, &self.shmem.ready_semaphore)
            .env(DONE_SEMAPHORE_ENV, &self.shmem.done_semaphore)
            .spawn()
            .map_err(ShmemLibError::Spawn)?;
        info!("spawned worker {} (pid {}) on {}", self.worker_program.display(), child.id(), path.display());
        let worker = WorkerProcess::command(child);

        let response = Producer::new(&region, semaphores.ready(), semaphores.done()).round_trip(request)?;

        // `done` alone does not prove the worker stopped touching the region.
        worker.reap()?;
        let destroyed = region.destroy();
        let released = semaphores.destroy();
        destroyed.and(released)?;
        debug!("re-exec round trip finished, {} response bytes", response.len());
        Ok(response)
    }
}
