use std::fs;
use std::io::Write;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tempfile::tempdir;

use shmem::core::semaphore::NamedSemaphore;
use shmem::ShmemConfig;

const PRODUCER: &str = env!("CARGO_BIN_EXE_producer");

fn wait_until<F: FnMut() -> bool>(mut ready: F) {
    let started = Instant::now();
    while !ready() {
        assert!(started.elapsed() < Duration::from_secs(10), "producer never reached the wait");
        thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn sigterm_while_waiting_releases_named_resources() {
    let dir = tempdir().expect("tempdir");
    let shmem = ShmemConfig {
        data_dir: dir.path().display().to_string(),
        region_file_name: "region".to_string(),
        ready_semaphore: format!("/shmem_term_ready_{}", std::process::id()),
        done_semaphore: format!("/shmem_term_done_{}", std::process::id()),
    };
    // `sleep` rejects the region path and exits without ever posting `done`.
    let config = format!(
        "strategy = \"reexec\"\nworker_program = \"sleep\"\n\n[shmem]\ndata_dir = \"{}\"\nregion_file_name = \"{}\"\nready_semaphore = \"{}\"\ndone_semaphore = \"{}\"\n",
        shmem.data_dir, shmem.region_file_name, shmem.ready_semaphore, shmem.done_semaphore
    );
    let config_path = dir.path().join("producer.toml");
    fs::write(&config_path, config).unwrap();
    let input_path = dir.path().join("numbers.txt");
    fs::write(&input_path, "1 2\n").unwrap();

    let mut producer = Command::new(PRODUCER)
        .arg("-c")
        .arg(&config_path)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .unwrap();
    {
        let mut stdin = producer.stdin.take().unwrap();
        writeln!(stdin, "{}", input_path.display()).unwrap();
    }

    // `ready` stays posted because nobody consumes it.
    wait_until(|| {
        NamedSemaphore::open(&shmem.ready_semaphore)
            .and_then(|sem| sem.value())
            .map(|value| value == 1)
            .unwrap_or(false)
    });
    assert_eq!(unsafe { libc::kill(producer.id() as libc::pid_t, libc::SIGTERM) }, 0);

    let output = producer.wait_with_output().unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(!String::from_utf8_lossy(&output.stdout).contains("Result:"));
    assert!(!shmem.region_path().exists(), "region link outlived the producer");
    assert!(NamedSemaphore::open(&shmem.ready_semaphore).is_err());
    assert!(NamedSemaphore::open(&shmem.done_semaphore).is_err());
}
