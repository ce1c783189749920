use std::error::Error;
use std::path::PathBuf;
use std::process;

use clap::Parser;
use log::info;

use shmem::compute::LineSums;
use shmem::worker::{run_linked, WorkerConfig};

#[derive(clap::Parser)]
#[clap(about = "Answers one request left in shared memory by the producer")]
struct Opts {
    /// Backing-store path created by the producer.
    #[clap(value_parser)]
    region: PathBuf,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let opts = match Opts::try_parse() {
        Ok(opts) => opts,
        Err(e) => {
            e.print()?;
            // Usage errors fail like any other worker failure; --help does not.
            process::exit(if e.use_stderr() { 1 } else { 0 });
        }
    };
    let cfg = WorkerConfig::from_env(opts.region);
    info!("serving {} ({} / {})", cfg.region_path.display(), cfg.ready_semaphore, cfg.done_semaphore);
    run_linked(&cfg, &LineSums)?;
    Ok(())
}
