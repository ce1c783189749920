use std::env;
use std::path::PathBuf;

use log::{debug, info};

use crate::compute::WorkerBody;
use crate::core::region::SharedRegion;
use crate::core::semaphore::HandshakeSemaphorePair;
use crate::core::{HandshakeSignal, Phase, DEFAULT_DONE_SEMAPHORE, DEFAULT_READY_SEMAPHORE, PAYLOAD_CAPACITY};
use crate::errors::{ComputeError, ShmemLibError};

/// Environment variables carrying the semaphore names into a re-exec'd worker.
pub const READY_SEMAPHORE_ENV: &str = "SHMEM_READY_SEMAPHORE";
pub const DONE_SEMAPHORE_ENV: &str = "SHMEM_DONE_SEMAPHORE";

/// The side that waits for a request and answers it.
pub struct Worker<'r, R: HandshakeSignal + ?Sized, D: HandshakeSignal + ?Sized> {
    region: &'r SharedRegion,
    ready: &'r R,
    done: &'r D,
    phase: Phase,
    cycles: usize,
}

impl<'r, R: HandshakeSignal + ?Sized, D: HandshakeSignal + ?Sized> Worker<'r, R, D> {
    pub fn new(region: &'r SharedRegion, ready: &'r R, done: &'r D) -> Worker<'r, R, D> {
        Worker { region, ready, done, phase: Phase::Idle, cycles: 0 }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn cycles(&self) -> usize {
        self.cycles
    }

    /// Blocks on `ready`, then refreshes the view before reading. Skipping
    /// the refresh could return the bytes as they were before the producer wrote.
    pub fn await_request(&mut self) -> Result<Vec<u8>, ShmemLibError> {
        self.phase.expect(&[Phase::Idle, Phase::Done], "await_request")?;
        self.ready.wait()?;
        let view = self.region.view();
        view.subscribe()?;
        self.phase = Phase::RequestVisible;
        let request = view.read()?;
        debug!("worker: read {} request bytes", request.len());
        Ok(request)
    }

    /// Commits the complete response, publishes it and signals `done`.
    pub fn respond(&mut self, response: &[u8]) -> Result<(), ShmemLibError> {
        self.phase.expect(&[Phase::RequestVisible], "respond")?;
        if response.len() > PAYLOAD_CAPACITY {
            return Err(ComputeError::ResponseTooLarge {
                len: response.len(),
                capacity: PAYLOAD_CAPACITY,
            }
            .into());
        }
        let view = self.region.view();
        view.commit(response)?;
        self.phase = Phase::ResponseWritten;
        view.publish()?;
        self.phase = Phase::ResponseVisible;
        self.done.signal()?;
        self.phase = Phase::Done;
        self.cycles += 1;
        debug!("worker: response of {} bytes published, done signaled", response.len());
        Ok(())
    }

    /// One full worker turn. A computation error returns before anything is
    /// written to the region, so the producer never sees a partial response.
    pub fn serve<B: WorkerBody + ?Sized>(&mut self, body: &B) -> Result<(), ShmemLibError> {
        let request = self.await_request()?;
        let response = body.compute(&request)?;
        self.respond(&response)
    }
}

/// What a re-exec'd worker needs to find its peer's resources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub region_path: PathBuf,
    pub ready_semaphore: String,
    pub done_semaphore: String,
}

impl WorkerConfig {
    pub fn from_env(region_path: PathBuf) -> WorkerConfig {
        WorkerConfig {
            region_path,
            ready_semaphore: env::var(READY_SEMAPHORE_ENV).unwrap_or_else(|_| DEFAULT_READY_SEMAPHORE.to_string()),
            done_semaphore: env::var(DONE_SEMAPHORE_ENV).unwrap_or_else(|_| DEFAULT_DONE_SEMAPHORE.to_string()),
        }
    }
}

/// Entry point of the worker program: re-open the producer's resources by
/// name, serve one request, release the local handles.
pub fn run_linked<B: WorkerBody + ?Sized>(cfg: &WorkerConfig, body: &B) -> Result<(), ShmemLibError> {
    let semaphores = HandshakeSemaphorePair::open(&cfg.ready_semaphore, &cfg.done_semaphore)?;
    let region = SharedRegion::open_linked(&cfg.region_path)?;

    Worker::new(&region, semaphores.ready(), semaphores.done()).serve(body)?;

    drop(region);
    semaphores.close()?;
    info!("worker: served request from {}", cfg.region_path.display());
    Ok(())
}
