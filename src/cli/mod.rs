pub mod config;
pub mod init;
pub mod validate;

use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

use config::Config;

#[derive(Parser)]
#[command(name = "barrage")]
#[command(about = "Ramping virtual-user load generator with k6-style thresholds", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a load test
    Run(RunArgs),
    /// Validate a config without running it
    Validate {
        /// Path to the configuration file (YAML/JSON)
        config: PathBuf,
    },
    /// Write a starter configuration
    Init {
        /// Output file path (default: barrage.yaml)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print the JSON schema of the configuration file
    Schema {
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Generate shell completions
    Completion {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Path to the configuration file (YAML/JSON)
    pub config: PathBuf,
    /// Constant VU count; with --duration replaces the configured stages
    #[arg(short, long)]
    pub vus: Option<usize>,
    /// Duration of the constant profile (e.g., "30s")
    #[arg(short, long)]
    pub duration: Option<String>,
    /// Sleep after every iteration (e.g., "1s")
    #[arg(long)]
    pub pacing: Option<String>,
    /// Abort the run as soon as any threshold is breached
    #[arg(long)]
    pub abort_on_fail: bool,
    /// Runtime worker threads
    #[arg(long)]
    pub threads: Option<usize>,
    /// Print the summary as JSON instead of the text report
    #[arg(long)]
    pub json: bool,
    /// Export the summary to a JSON file
    #[arg(long)]
    pub export_json: Option<PathBuf>,
    /// Export the summary to a CSV file
    #[arg(long)]
    pub export_csv: Option<PathBuf>,
}

impl RunArgs {
    /// Command-line flags win over file values.
    pub fn apply(&self, config: &mut Config) {
        if let (Some(vus), Some(duration)) = (self.vus, &self.duration) {
            config.stages = None;
            config.start_vus = None;
            config.vus = Some(vus);
            config.duration = Some(duration.clone());
        }
        if let Some(pacing) = &self.pacing {
            config.pacing = Some(pacing.clone());
        }
        if self.abort_on_fail {
            config.abort_on_fail = Some(true);
        }
        if let Some(threads) = self.threads {
            config.threads = Some(threads);
        }
    }
}

/// Worker threads for a run peaking at `peak_vus`: about one thread per
/// 50-75 VUs at high concurrency, never fewer than 8. The upper cap wins
/// over the core count on very large hosts.
pub fn runtime_threads(peak_vus: usize, base_parallelism: usize) -> usize {
    if peak_vus > 5000 {
        (peak_vus / 75).max(base_parallelism * 2).min(128)
    } else if peak_vus > 1000 {
        (peak_vus / 50).max(base_parallelism).min(64)
    } else {
        base_parallelism.max(8)
    }
}

/// Idle connections kept per host: about one per five VUs.
pub fn pool_size(peak_vus: usize) -> usize {
    (peak_vus / 5).clamp(500, 2000)
}
