use std::ffi::CString;
use std::io;

use log::{debug, warn};

use super::{termination_requested, HandshakeSignal};
use crate::errors::ShmemLibError;

const WHAT: &str = "semaphore";

/// A kernel-visible POSIX semaphore (`sem_open`).
///
/// The creating side owns the name and unlinks it when destroyed or
/// dropped; the other side only closes its handle.
pub struct NamedSemaphore {
    sem: *mut libc::sem_t,
    name: String,
    owner: bool,
    closed: bool,
}

fn c_name(name: &str) -> Result<CString, ShmemLibError> {
    if !name.starts_with('/') || name.len() < 2 || name[1..].contains('/') {
        return Err(ShmemLibError::Logic(format!(
            "semaphore name `{}` must be a single `/`-prefixed component",
            name
        )));
    }
    CString::new(name).map_err(|_| ShmemLibError::Logic(format!("semaphore name `{}` contains NUL", name)))
}

impl NamedSemaphore {
    /// Creates `name` with count 0 and owner-only permissions. Fails if the
    /// name already exists.
    pub fn create_exclusive(name: &str) -> Result<NamedSemaphore, ShmemLibError> {
        let c_name = c_name(name)?;
        let sem = unsafe {
            libc::sem_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                0o600 as libc::c_uint,
                0 as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED {
            return Err(ShmemLibError::creation(WHAT, name, io::Error::last_os_error()));
        }
        debug!("created semaphore {}", name);
        Ok(NamedSemaphore { sem, name: name.to_string(), owner: true, closed: false })
    }

    /// Attaches to a semaphore created by the other party.
    pub fn open(name: &str) -> Result<NamedSemaphore, ShmemLibError> {
        let c_name = c_name(name)?;
        let sem = unsafe { libc::sem_open(c_name.as_ptr(), 0) };
        if sem == libc::SEM_FAILED {
            return Err(ShmemLibError::open(WHAT, name, io::Error::last_os_error()));
        }
        debug!("opened semaphore {}", name);
        Ok(NamedSemaphore { sem, name: name.to_string(), owner: false, closed: false })
    }

    /// Removes `name` from the kernel namespace. A name that does not exist
    /// is reported as an error, never a crash.
    pub fn destroy_by_name(name: &str) -> Result<(), ShmemLibError> {
        let c_name = c_name(name)?;
        if unsafe { libc::sem_unlink(c_name.as_ptr()) } != 0 {
            return Err(ShmemLibError::release(WHAT, name, io::Error::last_os_error()));
        }
        debug!("unlinked semaphore {}", name);
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_owner(&self) -> bool {
        self.owner
    }

    /// Decrements without blocking. `Ok(false)` means a `wait` would block.
    pub fn try_wait(&self) -> Result<bool, ShmemLibError> {
        loop {
            if unsafe { libc::sem_trywait(self.sem) } == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) => return Ok(false),
                Some(libc::EINTR) => continue,
                _ => return Err(ShmemLibError::Signal(format!("sem_trywait on {}: {}", self.name, err))),
            }
        }
    }

    pub fn value(&self) -> Result<i32, ShmemLibError> {
        let mut value: libc::c_int = 0;
        if unsafe { libc::sem_getvalue(self.sem, &mut value) } != 0 {
            let err = io::Error::last_os_error();
            return Err(ShmemLibError::Signal(format!("sem_getvalue on {}: {}", self.name, err)));
        }
        Ok(value)
    }

    fn close_handle(&mut self) -> Result<(), ShmemLibError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if unsafe { libc::sem_close(self.sem) } != 0 {
            return Err(ShmemLibError::release(WHAT, self.name.clone(), io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Releases the local handle; the name stays usable by the other holder.
    pub fn close(mut self) -> Result<(), ShmemLibError> {
        self.owner = false;
        self.close_handle()
    }

    /// Closes the handle and, if this side created it, unlinks the name.
    pub fn destroy(mut self) -> Result<(), ShmemLibError> {
        let closed = self.close_handle();
        let unlinked = if self.owner {
            self.owner = false;
            NamedSemaphore::destroy_by_name(&self.name)
        } else {
            Ok(())
        };
        closed.and(unlinked)
    }
}

impl HandshakeSignal for NamedSemaphore {
    fn signal(&self) -> Result<(), ShmemLibError> {
        if unsafe { libc::sem_post(self.sem) } != 0 {
            let err = io::Error::last_os_error();
            return Err(ShmemLibError::Signal(format!("sem_post on {}: {}", self.name, err)));
        }
        Ok(())
    }

    /// Blocks until posted. A recorded termination signal ends the wait with
    /// `Interrupted`, whether it arrived before the call or during it.
    fn wait(&self) -> Result<(), ShmemLibError> {
        loop {
            if termination_requested() {
                return Err(ShmemLibError::Interrupted);
            }
            // signal-hook installs its handlers with SA_RESTART, so a plain
            // sem_wait may never report EINTR. Re-check the flag every tick.
            let deadline = wait_deadline()?;
            if unsafe { libc::sem_timedwait(self.sem, &deadline) } == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) | Some(libc::ETIMEDOUT) => continue,
                _ => return Err(ShmemLibError::Signal(format!("sem_wait on {}: {}", self.name, err))),
            }
        }
    }
}

const WAIT_TICK_NANOS: libc::c_long = 200_000_000;

/// Absolute `CLOCK_REALTIME` deadline one tick from now.
fn wait_deadline() -> Result<libc::timespec, ShmemLibError> {
    let mut now = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) } != 0 {
        return Err(ShmemLibError::Signal(format!("clock_gettime: {}", io::Error::last_os_error())));
    }
    now.tv_nsec += WAIT_TICK_NANOS;
    if now.tv_nsec >= 1_000_000_000 {
        now.tv_sec += 1;
        now.tv_nsec -= 1_000_000_000;
    }
    Ok(now)
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        if let Err(e) = self.close_handle() {
            warn!("{}", e);
        }
        if self.owner {
            if let Err(e) = NamedSemaphore::destroy_by_name(&self.name) {
                warn!("{}", e);
            }
        }
    }
}

/// The `ready`/`done` semaphores of one handshake.
pub struct HandshakeSemaphorePair {
    // Fields drop in declaration order, i.e. the reverse of creation order.
    done: NamedSemaphore,
    ready: NamedSemaphore,
}

impl HandshakeSemaphorePair {
    /// Creates both names exclusively. If `done` cannot be created, `ready`
    /// is unlinked again before the error is returned.
    pub fn create(ready_name: &str, done_name: &str) -> Result<HandshakeSemaphorePair, ShmemLibError> {
        let ready = NamedSemaphore::create_exclusive(ready_name)?;
        let done = NamedSemaphore::create_exclusive(done_name)?;
        Ok(HandshakeSemaphorePair { done, ready })
    }

    pub fn open(ready_name: &str, done_name: &str) -> Result<HandshakeSemaphorePair, ShmemLibError> {
        let ready = NamedSemaphore::open(ready_name)?;
        let done = NamedSemaphore::open(done_name)?;
        Ok(HandshakeSemaphorePair { done, ready })
    }

    pub fn ready(&self) -> &NamedSemaphore {
        &self.ready
    }

    pub fn done(&self) -> &NamedSemaphore {
        &self.done
    }

    /// Producer-side teardown, `done` first.
    pub fn destroy(self) -> Result<(), ShmemLibError> {
        let HandshakeSemaphorePair { done, ready } = self;
        let done = done.destroy();
        let ready = ready.destroy();
        done.and(ready)
    }

    /// Worker-side teardown: handles only.
    pub fn close(self) -> Result<(), ShmemLibError> {
        let HandshakeSemaphorePair { done, ready } = self;
        let done = done.close();
        let ready = ready.close();
        done.and(ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static NAME_COUNTER: AtomicUsize = AtomicUsize::new(0);

    fn unique_name(tag: &str) -> String {
        format!(
            "/shmem_sem_test_{}_{}_{}",
            tag,
            std::process::id(),
            NAME_COUNTER.fetch_add(1, Ordering::SeqCst)
        )
    }

    #[test]
    fn names_are_validated() {
        assert!(NamedSemaphore::create_exclusive("no_slash").is_err());
        assert!(NamedSemaphore::create_exclusive("/").is_err());
        assert!(NamedSemaphore::create_exclusive("/a/b").is_err());
        assert!(NamedSemaphore::create_exclusive("/nul\0name").is_err());
    }

    #[test]
    fn create_is_exclusive() {
        let name = unique_name("excl");
        let sem = NamedSemaphore::create_exclusive(&name).unwrap();
        match NamedSemaphore::create_exclusive(&name) {
            Err(ShmemLibError::ResourceCreation { source, .. }) => {
                assert_eq!(source.raw_os_error(), Some(libc::EEXIST))
            }
            other => panic!("expected a creation error, got {:?}", other.map(|_| ())),
        }
        sem.destroy().unwrap();
        assert!(NamedSemaphore::open(&name).is_err());
    }

    #[test]
    fn open_requires_existing_name() {
        assert!(matches!(
            NamedSemaphore::open(&unique_name("absent")),
            Err(ShmemLibError::ResourceOpen { .. })
        ));
    }

    #[test]
    fn destroying_unknown_name_is_handled() {
        match NamedSemaphore::destroy_by_name(&unique_name("never")) {
            Err(ShmemLibError::ResourceRelease { source, .. }) => {
                assert_eq!(source.raw_os_error(), Some(libc::ENOENT))
            }
            other => panic!("expected a release error, got {:?}", other),
        }
    }

    #[test]
    fn signal_then_wait_returns_to_zero() {
        let sem = NamedSemaphore::create_exclusive(&unique_name("count")).unwrap();
        assert_eq!(sem.value().unwrap(), 0);
        assert!(!sem.try_wait().unwrap());
        sem.signal().unwrap();
        assert_eq!(sem.value().unwrap(), 1);
        sem.wait().unwrap();
        assert_eq!(sem.value().unwrap(), 0);
    }

    #[test]
    fn wait_outlasts_several_ticks() {
        let name = unique_name("ticks");
        let sem = NamedSemaphore::create_exclusive(&name).unwrap();
        let poster = {
            let name = name.clone();
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(3 * 200 + 100));
                NamedSemaphore::open(&name).unwrap().signal().unwrap();
            })
        };
        sem.wait().unwrap();
        poster.join().unwrap();
        assert_eq!(sem.value().unwrap(), 0);
    }

    #[test]
    fn dropping_the_owner_unlinks() {
        let name = unique_name("drop");
        {
            let _sem = NamedSemaphore::create_exclusive(&name).unwrap();
            let peer = NamedSemaphore::open(&name).unwrap();
            assert!(!peer.is_owner());
            peer.close().unwrap();
            // The owner is still attached after the peer closed.
            assert!(NamedSemaphore::open(&name).is_ok());
        }
        assert!(NamedSemaphore::open(&name).is_err());
    }

    #[test]
    fn pair_creation_rolls_back_ready_when_done_exists() {
        let ready = unique_name("ready");
        let done = unique_name("done");
        let squatter = NamedSemaphore::create_exclusive(&done).unwrap();

        assert!(HandshakeSemaphorePair::create(&ready, &done).is_err());
        assert!(NamedSemaphore::open(&ready).is_err());

        squatter.destroy().unwrap();
        let pair = HandshakeSemaphorePair::create(&ready, &done).unwrap();
        let peer = HandshakeSemaphorePair::open(&ready, &done).unwrap();
        peer.close().unwrap();
        pair.destroy().unwrap();
        assert!(NamedSemaphore::open(&ready).is_err());
        assert!(NamedSemaphore::open(&done).is_err());
    }
}
