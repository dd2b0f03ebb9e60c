use clap::Parser;
use cpq_extract::buffer_writer::{run_writer_process, WriterOptions};
use cpq_extract::layout::RunLayout;
use dotenv::dotenv;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "buffer_writer")]
#[command(about = "Single writer for a comparison run's buffer directory", long_about = None)]
struct Args {
    /// Data directory of the comparison run
    #[arg(long)]
    data_dir: PathBuf,
    #[arg(long)]
    comparison_id: String,
    /// Seconds between sweeps for unqueued buffer pages
    #[arg(long, default_value_t = 10)]
    sweep_interval_secs: u64,
    /// Buffer pages idle this long are picked up by the sweep
    #[arg(long, default_value_t = 30)]
    stale_after_secs: u64,
    /// Lock markers older than this are treated as abandoned
    #[arg(long, default_value_t = 15)]
    stale_lock_secs: u64,
}

fn main() {
    dotenv().ok();
    cpq_extract::init_tracing("buffer_writer");
    let args = Args::parse();
    tracing::info!(comparison_id = %args.comparison_id, "buffer writer starting");

    let options = WriterOptions {
        sweep_interval: Duration::from_secs(args.sweep_interval_secs),
        stale_after: Duration::from_secs(args.stale_after_secs),
        stale_lock_after: Duration::from_secs(args.stale_lock_secs),
    };
    match run_writer_process(RunLayout::new(&args.data_dir), options) {
        Ok(stats) => {
            tracing::info!(
                pages = stats.pages_appended,
                records = stats.records_appended,
                quarantined = stats.quarantined,
                failures = stats.failures,
                "buffer writer exiting"
            );
            if stats.failures > 0 {
                std::process::exit(1);
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "buffer writer failed");
            std::process::exit(1);
        }
    }
}
