use clap::{Parser, Subcommand};
use cpq_extract::config::{RunConfig, Settings};
use cpq_extract::launcher::{ProcessLauncher, WorkerBinaries};
use cpq_extract::orchestrator::{FetchOrchestrator, OrchestratorOptions};
use cpq_extract::parquet::{self, ParquetConverter};
use cpq_extract::ExtractError;
use dotenv::dotenv;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "cpq-extract")]
#[command(about = "Parallel multi-org record extraction", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch every configured object from every org into JSONL files
    Run {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        comparison_id: String,
        /// Number of fetcher processes to budget for
        #[arg(long)]
        concurrency: Option<usize>,
        /// Settings file with `maxConcurrentWorkers`
        #[arg(long)]
        settings: Option<PathBuf>,
        /// Convert the results to parquet afterwards
        #[arg(long)]
        convert: bool,
        #[arg(long, default_value_t = 60)]
        drain_timeout_secs: u64,
    },
    /// Show the shard plan without spawning anything
    Plan {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        concurrency: Option<usize>,
        #[arg(long)]
        settings: Option<PathBuf>,
    },
    /// Convert one JSONL file to parquet
    Convert {
        input: PathBuf,
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(long, default_value_t = 300)]
        timeout_secs: u64,
    },
    /// Convert every stale JSONL file in a directory
    AutoConvert {
        dir: PathBuf,
        #[arg(long)]
        recursive: bool,
        #[arg(long)]
        force: bool,
    },
    /// Conversion status of a directory
    Stats { dir: PathBuf },
}

fn print_auto_convert(report: &parquet::AutoConvertReport) {
    println!(
        "[cpq-extract] Converted: {}, failed: {}, up to date: {}",
        report.converted, report.failed, report.up_to_date
    );
    for result in &report.results {
        if let Err(e) = &result.outcome {
            println!("[cpq-extract]   {}: {}", result.input.display(), e);
        }
    }
}

fn run(cli: Cli) -> Result<(), ExtractError> {
    match cli.command {
        Commands::Run { config, comparison_id, concurrency, settings, convert, drain_timeout_secs } => {
            let config = RunConfig::load(&config)?;
            let settings = Settings::discover(settings.as_deref())?;
            let launcher = ProcessLauncher::new(WorkerBinaries::beside_current_exe()?);
            let options = OrchestratorOptions {
                drain_timeout: Duration::from_secs(drain_timeout_secs),
                ..OrchestratorOptions::default()
            };
            let mut orchestrator = FetchOrchestrator::new(launcher, options).with_settings(settings);
            let summary = orchestrator.run(&config, &comparison_id, concurrency)?;
            println!(
                "[cpq-extract] Fetched {} records: {} orgs, {} objects, {} fetchers",
                summary.total_records, summary.org_count, summary.object_count, summary.fetcher_count
            );
            println!("[cpq-extract] Data directory: {}", summary.data_dir.display());
            match summary.writer_exit {
                Some(0) => {}
                Some(code) => println!("[cpq-extract] Warning: buffer writer exited with code {}, check its log", code),
                None => println!("[cpq-extract] Warning: buffer writer had to be killed, check {}", summary.data_dir.display()),
            }
            if convert {
                let report = ParquetConverter::default().auto_convert(&summary.data_dir, true, false)?;
                print_auto_convert(&report);
            }
            Ok(())
        }
        Commands::Plan { config, concurrency, settings } => {
            let config = RunConfig::load(&config)?;
            let settings = Settings::discover(settings.as_deref())?;
            let budget = cpq_extract::concurrency::resolve_from_environment(concurrency, &settings);
            let plan = cpq_extract::plan::plan_jobs(&config.org_usernames(), &config.objects, "plan", budget.fetchers);
            println!(
                "[cpq-extract] Budget {} ({:?}), {} per org, {} jobs",
                budget.fetchers,
                budget.source,
                plan.process_per_org,
                plan.jobs.len()
            );
            for job in &plan.jobs {
                println!("[cpq-extract]   {} {} -> {}", job.fetcher_id, job.org, job.object_names().join(", "));
            }
            Ok(())
        }
        Commands::Convert { input, output, timeout_secs } => {
            let converter = ParquetConverter::default().with_timeout(Duration::from_secs(timeout_secs));
            let out = converter.convert(&input, output.as_deref())?;
            println!("[cpq-extract] Wrote {} ({} bytes)", out.output_path.display(), out.output_size);
            Ok(())
        }
        Commands::AutoConvert { dir, recursive, force } => {
            let report = ParquetConverter::default().auto_convert(&dir, recursive, force)?;
            print_auto_convert(&report);
            if report.failed > 0 {
                return Err(ExtractError::Conversion {
                    input: dir,
                    reason: format!("{} file(s) failed to convert", report.failed),
                });
            }
            Ok(())
        }
        Commands::Stats { dir } => {
            let stats = parquet::stats(&dir)?;
            println!("[cpq-extract] JSONL files: {}", stats.total_jsonl);
            println!("[cpq-extract] With parquet: {} ({} up to date)", stats.has_parquet, stats.up_to_date);
            println!("[cpq-extract] Needing conversion: {}", stats.needs_conversion);
            println!(
                "[cpq-extract] Size: {} MB JSONL, {} MB parquet",
                stats.total_size_jsonl / 1_048_576,
                stats.total_size_parquet / 1_048_576
            );
            Ok(())
        }
    }
}

fn main() {
    dotenv().ok();
    cpq_extract::init_tracing("cpq-extract");
    if let Err(e) = run(Cli::parse()) {
        eprintln!("[cpq-extract] {}", e);
        std::process::exit(1);
    }
}
