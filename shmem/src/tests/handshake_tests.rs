use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use tempfile::{tempdir, TempDir};

use crate::compute::LineSums;
use crate::core::region::SharedRegion;
use crate::core::semaphore::{HandshakeSemaphorePair, NamedSemaphore};
use crate::core::{Phase, REGION_SIZE};
use crate::producer::Producer;
use crate::worker::{run_linked, Worker, WorkerConfig};
use crate::{ComputeError, ShmemLibError};

// Both roles run in one test process on separate threads. Each thread maps
// the region and opens the semaphores itself, exactly as a second process would.

struct Handshake {
    _dir: TempDir,
    path: PathBuf,
    ready: String,
    done: String,
}

fn handshake(tag: &str) -> Handshake {
    static ID_COUNTER: AtomicUsize = AtomicUsize::new(0);
    let id = ID_COUNTER.fetch_add(1, AtomicOrdering::SeqCst);
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join(format!("region_{}", tag));
    Handshake {
        _dir: dir,
        path,
        ready: format!("/shmem_hs_ready_{}_{}_{}", tag, std::process::id(), id),
        done: format!("/shmem_hs_done_{}_{}_{}", tag, std::process::id(), id),
    }
}

fn spawn_worker(hs: &Handshake, cycles: usize) -> JoinHandle<Result<usize, ShmemLibError>> {
    let (path, ready, done) = (hs.path.clone(), hs.ready.clone(), hs.done.clone());
    thread::spawn(move || {
        let semaphores = HandshakeSemaphorePair::open(&ready, &done)?;
        let region = SharedRegion::open_linked(&path)?;
        let mut worker = Worker::new(&region, semaphores.ready(), semaphores.done());
        for _ in 0..cycles {
            worker.serve(&LineSums)?;
        }
        Ok(worker.cycles())
    })
}

#[test]
fn test_round_trip_sums_lines() -> Result<(), ShmemLibError> {
    let hs = handshake("sum");
    let semaphores = HandshakeSemaphorePair::create(&hs.ready, &hs.done)?;
    let region = SharedRegion::create_linked(&hs.path, REGION_SIZE)?;
    let worker = spawn_worker(&hs, 1);

    let mut producer = Producer::new(&region, semaphores.ready(), semaphores.done());
    let response = producer.round_trip(b"1.5 2.5\n3.0\n")?;
    assert_eq!(response, b"Sum: 4.00\nSum: 3.00\n");
    assert_eq!(producer.phase(), Phase::Done);
    assert_eq!(worker.join().expect("worker thread panicked")?, 1);

    region.destroy()?;
    semaphores.destroy()?;
    assert!(!hs.path.exists());
    assert!(NamedSemaphore::open(&hs.ready).is_err());
    Ok(())
}

#[test]
fn test_empty_request_yields_empty_response() -> Result<(), ShmemLibError> {
    let hs = handshake("empty");
    let semaphores = HandshakeSemaphorePair::create(&hs.ready, &hs.done)?;
    let region = SharedRegion::create_linked(&hs.path, REGION_SIZE)?;
    let worker = spawn_worker(&hs, 1);

    let response = Producer::new(&region, semaphores.ready(), semaphores.done()).round_trip(b"")?;
    assert!(response.is_empty());
    assert_eq!(region.view().size()?, 0);
    worker.join().expect("worker thread panicked")?;
    Ok(())
}

#[test]
fn test_sequential_cycles_alternate() -> Result<(), ShmemLibError> {
    let requests: [&[u8]; 4] = [b"1 1\n", b"2.25\n\n0.75 0.25\n", b"1 1\n", b""];
    let hs = handshake("cycles");
    let semaphores = HandshakeSemaphorePair::create(&hs.ready, &hs.done)?;
    let region = SharedRegion::create_linked(&hs.path, REGION_SIZE)?;
    let worker = spawn_worker(&hs, requests.len());

    let mut producer = Producer::new(&region, semaphores.ready(), semaphores.done());
    let mut responses = Vec::new();
    for request in requests.iter() {
        responses.push(producer.round_trip(request)?);
        // Every signal has been consumed by exactly one wait.
        assert_eq!(semaphores.ready().value()?, 0);
        assert_eq!(semaphores.done().value()?, 0);
    }
    assert_eq!(producer.cycles(), requests.len());
    assert_eq!(worker.join().expect("worker thread panicked")?, requests.len());

    assert_eq!(responses[0], b"Sum: 2.00\n");
    assert_eq!(responses[1], b"Sum: 2.25\nSum: 1.00\n");
    assert_eq!(responses[0], responses[2]);
    assert!(responses[3].is_empty());
    Ok(())
}

#[test]
fn test_malformed_request_never_signals_done() -> Result<(), ShmemLibError> {
    let hs = handshake("malformed");
    let semaphores = HandshakeSemaphorePair::create(&hs.ready, &hs.done)?;
    let region = SharedRegion::create_linked(&hs.path, REGION_SIZE)?;
    let worker = spawn_worker(&hs, 1);

    let mut producer = Producer::new(&region, semaphores.ready(), semaphores.done());
    producer.submit(b"abc")?;
    match worker.join().expect("worker thread panicked") {
        Err(ShmemLibError::Computation(ComputeError::MalformedToken { token, .. })) => assert_eq!(token, "abc"),
        other => panic!("expected a malformed token error, got {:?}", other),
    }

    // collect() would block forever here; check the count instead.
    assert!(!semaphores.done().try_wait()?);
    assert_eq!(producer.phase(), Phase::RequestVisible);
    // Nothing was committed over the request.
    assert_eq!(region.view().read()?, b"abc");
    Ok(())
}

#[test]
fn test_response_is_invisible_until_committed() -> Result<(), ShmemLibError> {
    let hs = handshake("commit");
    let semaphores = HandshakeSemaphorePair::create(&hs.ready, &hs.done)?;
    let region = SharedRegion::create_linked(&hs.path, REGION_SIZE)?;

    let (got_request_tx, got_request_rx) = mpsc::channel();
    let (proceed_tx, proceed_rx) = mpsc::channel::<()>();
    let (path, ready, done) = (hs.path.clone(), hs.ready.clone(), hs.done.clone());
    let worker = thread::spawn(move || -> Result<(), ShmemLibError> {
        let semaphores = HandshakeSemaphorePair::open(&ready, &done)?;
        let region = SharedRegion::open_linked(&path)?;
        let mut worker = Worker::new(&region, semaphores.ready(), semaphores.done());
        let request = worker.await_request()?;
        got_request_tx.send(request).expect("send");
        proceed_rx.recv().expect("recv");
        worker.respond(b"Sum: 10.00\n")
    });

    let mut producer = Producer::new(&region, semaphores.ready(), semaphores.done());
    producer.submit(b"4 6\n")?;
    assert_eq!(got_request_rx.recv().expect("recv"), b"4 6\n");
    assert_eq!(semaphores.done().value()?, 0);
    assert_eq!(region.view().read()?, b"4 6\n");

    proceed_tx.send(()).expect("send");
    assert_eq!(producer.collect()?, b"Sum: 10.00\n");
    worker.join().expect("worker thread panicked")?;
    Ok(())
}

#[test]
fn test_run_linked_serves_one_request() -> Result<(), ShmemLibError> {
    let hs = handshake("linked");
    let semaphores = HandshakeSemaphorePair::create(&hs.ready, &hs.done)?;
    let region = SharedRegion::create_linked(&hs.path, REGION_SIZE)?;
    let cfg = WorkerConfig {
        region_path: hs.path.clone(),
        ready_semaphore: hs.ready.clone(),
        done_semaphore: hs.done.clone(),
    };
    let worker = thread::spawn(move || run_linked(&cfg, &LineSums));

    let response = Producer::new(&region, semaphores.ready(), semaphores.done()).round_trip(b"-1 0.5")?;
    assert_eq!(response, b"Sum: -0.50\n");
    worker.join().expect("worker thread panicked")?;

    // The worker only closed its handles; the names are still ours to remove.
    assert!(hs.path.exists());
    region.destroy()?;
    semaphores.destroy()?;
    Ok(())
}

#[test]
fn test_run_linked_without_producer_fails() {
    let hs = handshake("orphan");
    let cfg = WorkerConfig {
        region_path: hs.path.clone(),
        ready_semaphore: hs.ready.clone(),
        done_semaphore: hs.done.clone(),
    };
    assert!(matches!(run_linked(&cfg, &LineSums), Err(ShmemLibError::ResourceOpen { .. })));
}
