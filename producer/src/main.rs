use std::error::Error;
use std::fs::File;
use std::io::{self, BufRead, Read, Write};

use clap::Parser;
use log::{info, warn};

use shmem::core::install_termination_hooks;
use shmem::launcher::Strategy;
use shmem::producer::ProducerConfig;
use shmem::PAYLOAD_CAPACITY;

#[derive(clap::Parser)]
#[clap(about = "Hands a file to a worker process through shared memory and prints the result")]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "shmem-producer.toml")]
    config: String,
    /// Overrides the strategy from the config file: `reexec` or `fork`.
    #[clap(long = "strategy")]
    strategy: Option<Strategy>,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let opts: Opts = Opts::parse();
    let mut cfg: ProducerConfig = confy::load_path(&opts.config)?;
    if let Some(strategy) = opts.strategy {
        cfg.strategy = strategy;
    }
    info!("{:?}", &cfg);

    let filename = prompt_filename()?;
    let request = read_request(&filename)?;
    let launcher = cfg.launcher()?;
    // From here on a termination signal must unwind through the guards so the
    // named resources get released.
    install_termination_hooks()?;
    let response = launcher.round_trip(&request)?;

    let mut stdout = io::stdout().lock();
    stdout.write_all(b"Result:\n")?;
    stdout.write_all(&response)?;
    stdout.flush()?;
    Ok(())
}

fn prompt_filename() -> Result<String, Box<dyn Error>> {
    let mut stdout = io::stdout();
    stdout.write_all(b"Enter filename: ")?;
    stdout.flush()?;

    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    let filename = line.trim_end_matches(|c| c == '\n' || c == '\r');
    if filename.is_empty() {
        return Err("no filename given".into());
    }
    Ok(filename.to_string())
}

/// Reads at most one payload's worth of the file.
fn read_request(filename: &str) -> Result<Vec<u8>, Box<dyn Error>> {
    let mut request = Vec::with_capacity(PAYLOAD_CAPACITY);
    File::open(filename)?
        .take(PAYLOAD_CAPACITY as u64 + 1)
        .read_to_end(&mut request)?;
    if request.len() > PAYLOAD_CAPACITY {
        warn!("{} is larger than {} bytes, the rest is ignored", filename, PAYLOAD_CAPACITY);
        request.truncate(PAYLOAD_CAPACITY);
    }
    Ok(request)
}
