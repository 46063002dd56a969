use clap::{Parser, Subcommand, ValueEnum};
use miette::Result;
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(Clone, ValueEnum, Debug)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser)]
#[command(name = "fmprep")]
#[command(version = "0.1.0")]
#[command(about = "Leakage-safe train/test preprocessing for factorization machines", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Increase logging verbosity (Info -> Debug)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Silence all logs
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Log format (text or json)
    #[arg(long, value_enum, global = true, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an experiment from a YAML definition file
    Run {
        /// Path to the experiment YAML file
        #[arg(value_name = "EXPERIMENT_FILE")]
        experiment: PathBuf,
    },
    /// Preprocess an already-split train/test pair of CSV files
    Prepare {
        /// Training-partition CSV
        #[arg(value_name = "TRAIN_CSV")]
        train: PathBuf,
        /// Testing-partition CSV
        #[arg(value_name = "TEST_CSV")]
        test: PathBuf,
        /// Feature guide file
        #[arg(short, long, value_name = "GUIDE")]
        guide: PathBuf,
        /// Output directory for libFM files and transform state
        #[arg(short, long, value_name = "DIR", default_value = ".")]
        output_dir: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.quiet {
        Level::ERROR
    } else if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    // FMPREP_LOG overrides the CLI verbosity flags.
    let filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .with_env_var("FMPREP_LOG")
        .from_env_lossy();

    let run_id = Uuid::new_v4();

    match cli.log_format {
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .with_span_list(false)
                .with_current_span(false)
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }

    let _span = tracing::info_span!("root", run_id = %run_id).entered();

    match &cli.command {
        Commands::Run { experiment } => {
            fmprep::runner::run_experiment(experiment, run_id)?;
        }
        Commands::Prepare {
            train,
            test,
            guide,
            output_dir,
        } => {
            let options = fmprep::split::PreprocessOptions::default();
            fmprep::runner::prepare_pair(train, test, guide, output_dir, &options)?;
        }
    }

    Ok(())
}
