use log::debug;
use serde_derive::{Deserialize, Serialize};

use crate::compute::LineSums;
use crate::core::region::SharedRegion;
use crate::core::{termination_requested, HandshakeSignal, Phase, ShmemConfig};
use crate::errors::ShmemLibError;
use crate::launcher::{ForkLauncher, Launcher, ReexecLauncher, Strategy};

#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    pub shmem: ShmemConfig,
    pub strategy: Strategy,
    /// Worker executable for the re-exec strategy. Empty means the `worker`
    /// binary next to the running one.
    pub worker_program: String,
}

impl ProducerConfig {
    pub fn launcher(&self) -> Result<Box<dyn Launcher>, ShmemLibError> {
        match self.strategy {
            Strategy::Reexec => {
                let program = if self.worker_program.is_empty() {
                    ReexecLauncher::sibling_worker_program()?
                } else {
                    self.worker_program.clone().into()
                };
                Ok(Box::new(ReexecLauncher::new(self.shmem.clone(), program)))
            }
            Strategy::Fork => Ok(Box::new(ForkLauncher::new(LineSums))),
        }
    }
}

/// The side that writes a request and waits for the response.
pub struct Producer<'r, R: HandshakeSignal + ?Sized, D: HandshakeSignal + ?Sized> {
    region: &'r SharedRegion,
    ready: &'r R,
    done: &'r D,
    phase: Phase,
    cycles: usize,
}

impl<'r, R: HandshakeSignal + ?Sized, D: HandshakeSignal + ?Sized> Producer<'r, R, D> {
    pub fn new(region: &'r SharedRegion, ready: &'r R, done: &'r D) -> Producer<'r, R, D> {
        Producer { region, ready, done, phase: Phase::Idle, cycles: 0 }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Completed request/response cycles.
    pub fn cycles(&self) -> usize {
        self.cycles
    }

    pub fn write_request(&mut self, request: &[u8]) -> Result<(), ShmemLibError> {
        self.phase.expect(&[Phase::Idle, Phase::Done], "write_request")?;
        self.region.view().commit(request)?;
        self.phase = Phase::RequestWritten;
        debug!("producer: wrote {} request bytes", request.len());
        Ok(())
    }

    /// Publishes the request, then signals `ready`. Never the other way round.
    pub fn publish_request(&mut self) -> Result<(), ShmemLibError> {
        self.phase.expect(&[Phase::RequestWritten], "publish_request")?;
        self.region.view().publish()?;
        self.ready.signal()?;
        self.phase = Phase::RequestVisible;
        debug!("producer: request published, ready signaled");
        Ok(())
    }

    pub fn submit(&mut self, request: &[u8]) -> Result<(), ShmemLibError> {
        self.write_request(request)?;
        self.publish_request()
    }

    /// Blocks on `done`, refreshes the view and reads the response.
    ///
    /// There is no timeout: a worker that dies before signaling leaves this
    /// call blocked. A recorded termination signal returns `Interrupted`.
    pub fn collect(&mut self) -> Result<Vec<u8>, ShmemLibError> {
        self.phase.expect(&[Phase::RequestVisible], "collect")?;
        if termination_requested() {
            return Err(ShmemLibError::Interrupted);
        }
        self.done.wait()?;
        let view = self.region.view();
        view.subscribe()?;
        self.phase = Phase::ResponseVisible;
        let response = view.read()?;
        self.phase = Phase::Done;
        self.cycles += 1;
        debug!("producer: read {} response bytes", response.len());
        Ok(response)
    }

    pub fn round_trip(&mut self, request: &[u8]) -> Result<Vec<u8>, ShmemLibError> {
        self.submit(request)?;
        self.collect()
    }
}
