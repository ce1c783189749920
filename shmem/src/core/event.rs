use log::debug;
use raw_sync::events::{Event, EventImpl, EventInit, EventState};
use raw_sync::Timeout;

use super::region::AnonymousMapping;
use super::HandshakeSignal;
use crate::errors::ShmemLibError;

// One page comfortably holds the process-shared mutex, condvar and flag.
const EVENT_REGION_SIZE: usize = 4096;

/// Auto-reset event living in anonymous shared memory.
///
/// It has no name: a child created by `fork(2)` inherits both the mapping
/// and this handle. Setting it when nobody waits leaves it signaled for the
/// next `wait`, which clears it again, i.e. a binary semaphore.
pub struct InheritedEvent {
    // Declared first so the handle is released before the memory it points into.
    event: Box<dyn EventImpl>,
    _mapping: AnonymousMapping,
}

impl InheritedEvent {
    pub fn create() -> Result<InheritedEvent, ShmemLibError> {
        let mapping = AnonymousMapping::new(EVENT_REGION_SIZE)?;
        // Safety: the mapping is fresh, zeroed and outlives the event handle.
        let (event, used) = unsafe { Event::new(mapping.as_ptr(), true) }
            .map_err(|e| ShmemLibError::Signal(format!("failed to initialise event: {}", e)))?;
        if used > EVENT_REGION_SIZE {
            return Err(ShmemLibError::Logic(format!(
                "event needs {} bytes, only {} mapped",
                used, EVENT_REGION_SIZE
            )));
        }
        debug!("created inherited event ({} bytes)", used);
        Ok(InheritedEvent { event, _mapping: mapping })
    }
}

impl HandshakeSignal for InheritedEvent {
    fn signal(&self) -> Result<(), ShmemLibError> {
        self.event
            .set(EventState::Signaled)
            .map_err(|e| ShmemLibError::Signal(format!("event set: {}", e)))
    }

    fn wait(&self) -> Result<(), ShmemLibError> {
        self.event
            .wait(Timeout::Infinite)
            .map_err(|e| ShmemLibError::Signal(format!("event wait: {}", e)))
    }
}
