use std::io;
use std::panic::{self, AssertUnwindSafe};

use log::{debug, error, info};

use super::{Launcher, WorkerProcess};
use crate::compute::WorkerBody;
use crate::core::event::InheritedEvent;
use crate::core::region::SharedRegion;
use crate::core::{ForkEdge, HandshakeSignal, REGION_SIZE};
use crate::errors::ShmemLibError;
use crate::producer::Producer;
use crate::worker::Worker;

/// Forks and runs the worker body in the child, which inherits the anonymous
/// region and the `done` event. No names are involved.
pub struct ForkLauncher<B: WorkerBody> {
    body: B,
}

impl<B: WorkerBody> ForkLauncher<B> {
    pub fn new(body: B) -> ForkLauncher<B> {
        ForkLauncher { body }
    }
}

impl<B: WorkerBody> Launcher for ForkLauncher<B> {
    fn round_trip(&self, request: &[u8]) -> Result<Vec<u8>, ShmemLibError> {
        let region = SharedRegion::create_anonymous(REGION_SIZE)?;
        let done = InheritedEvent::create()?;

        let mut producer = Producer::new(&region, &ForkEdge, &done);
        // Published before fork(2); the fork itself is the `ready` edge.
        producer.submit(request)?;
        let worker = fork_worker(&region, &done, &self.body)?;

        let response = producer.collect()?;
        worker.reap()?;
        drop(done);
        region.destroy()?;
        debug!("fork round trip finished, {} response bytes", response.len());
        Ok(response)
    }
}

fn fork_worker<B: WorkerBody>(
    region: &SharedRegion,
    done: &InheritedEvent,
    body: &B,
) -> Result<WorkerProcess, ShmemLibError> {
    match unsafe { libc::fork() } {
        -1 => Err(ShmemLibError::Spawn(io::Error::last_os_error())),
        0 => {
            let code = serve_in_child(region, done, body);
            // Skip destructors and atexit handlers: they belong to the parent.
            unsafe { libc::_exit(code) }
        }
        pid => {
            info!("forked worker (pid {})", pid);
            Ok(WorkerProcess::forked(pid))
        }
    }
}

/// Runs the worker side and turns the outcome into an exit status. A panic
/// must not unwind into the parent's frames copied into the child.
fn serve_in_child<D, B>(region: &SharedRegion, done: &D, body: &B) -> libc::c_int
where
    D: HandshakeSignal + ?Sized,
    B: WorkerBody,
{
    match panic::catch_unwind(AssertUnwindSafe(|| Worker::new(region, &ForkEdge, done).serve(body))) {
        Ok(Ok(())) => 0,
        Ok(Err(e)) => {
            error!("worker: {}", e);
            1
        }
        Err(_) => {
            error!("worker: body panicked");
            1
        }
    }
}
