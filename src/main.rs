use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use barrage::cli::config::Config;
use barrage::cli::{pool_size, runtime_threads, Cli, Commands, RunArgs};
use barrage::engine::http_client::HttpClient;
use barrage::engine::http_workload::HttpWorkload;
use barrage::engine::Engine;
use barrage::stats::summary::{exit_code, RunSummary};
use barrage::ConfigError;

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("barrage=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run(args) => run(args),
        Commands::Validate { config } => barrage::cli::validate::run_validate(&config)
            .map(|_| exit_code::OK)
            .or_else(config_exit),
        Commands::Init { output } => {
            barrage::cli::init::run_init(output.as_deref()).map(|_| exit_code::OK)
        }
        Commands::Schema { output } => schema(output.as_deref()).map(|_| exit_code::OK),
        Commands::Completion { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "barrage", &mut std::io::stdout());
            Ok(exit_code::OK)
        }
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(exit_code::GENERIC_ERROR)
        }
    }
}

/// Map configuration errors to their dedicated exit code.
fn config_exit(err: anyhow::Error) -> Result<u8> {
    if let Some(config_err) = err.downcast_ref::<ConfigError>() {
        error!("{}", config_err);
        return Ok(exit_code::INVALID_CONFIG);
    }
    Err(err)
}

fn schema(output: Option<&std::path::Path>) -> Result<()> {
    let schema = schemars::schema_for!(Config);
    let schema_json = serde_json::to_string_pretty(&schema)?;
    if let Some(out_path) = output {
        std::fs::write(out_path, schema_json)?;
        println!("JSON Schema written to {:?}", out_path);
    } else {
        println!("{}", schema_json);
    }
    Ok(())
}

fn run(args: RunArgs) -> Result<u8> {
    let (engine, threads) = match prepare(&args) {
        Ok(prepared) => prepared,
        Err(e) => return config_exit(e),
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(threads)
        .enable_all()
        .build()
        .context("failed to build the tokio runtime")?;
    info!(threads, "runtime ready");

    let summary = runtime.block_on(async move {
        let abort = engine.abort_handle();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, stopping run");
                abort.abort();
            }
        });
        engine.run().await
    })?;

    report(&args, &summary)?;
    Ok(summary.exit_code())
}

fn prepare(args: &RunArgs) -> Result<(Engine, usize)> {
    let mut config = Config::load(&args.config)?;
    args.apply(&mut config);

    let options = config.into_options()?;
    let workload_config = config
        .workload
        .as_ref()
        .ok_or_else(|| ConfigError::Workload("no workload configured".to_string()))?;

    let peak = options.plan()?.max_target();
    let threads = config
        .threads
        .unwrap_or_else(|| runtime_threads(peak, num_cpus::get()));

    let workload = HttpWorkload::with_client(workload_config, HttpClient::with_pool_size(pool_size(peak)))?;
    let engine = Engine::new(options, Arc::new(workload))?;
    Ok((engine, threads))
}

fn report(args: &RunArgs, summary: &RunSummary) -> Result<()> {
    if args.json {
        println!("{}", summary.to_json());
    } else {
        summary.report();
    }
    if let Some(path) = &args.export_json {
        std::fs::write(path, summary.to_json())
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!(path = %path.display(), "summary exported");
    }
    if let Some(path) = &args.export_csv {
        std::fs::write(path, barrage::stats::csv::generate_csv(summary))
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!(path = %path.display(), "csv exported");
    }
    Ok(())
}
