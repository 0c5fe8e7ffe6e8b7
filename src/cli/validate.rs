use anyhow::Result;
use std::path::Path;
use std::sync::Arc;

use crate::cli::config::Config;
use crate::engine::http_workload::HttpWorkload;
use crate::engine::Engine;
use crate::error::ConfigError;
use crate::utils::format_duration;

/// Parse and validate a config without generating any load. Thresholds are
/// compiled against the real metric registry, so errors match what `run`
/// would report.
pub fn run_validate(config_path: &Path) -> Result<()> {
    println!("Validating {}...", config_path.display());

    let config = match Config::load(config_path) {
        Ok(c) => c,
        Err(e) => {
            println!("  ✗ {}", e);
            return Err(e.into());
        }
    };
    println!("  ✓ Config parsed");

    let (engine, requests) = match build_engine(&config) {
        Ok(built) => built,
        Err(e) => {
            println!("  ✗ {}", e);
            return Err(e);
        }
    };

    let plan = engine.plan();
    println!(
        "    stages: {} stage(s), {} total, peak {} VUs",
        plan.stages().len(),
        format_duration(plan.total_duration()),
        plan.max_target()
    );
    for stage in plan.stages() {
        println!(
            "      {} -> {} VUs",
            format_duration(stage.duration),
            stage.target
        );
    }
    if let Some(thresholds) = &config.thresholds {
        let count: usize = thresholds.values().map(|v| v.len()).sum();
        println!("    thresholds: {}", count);
    }
    println!("    requests: {}", requests.join(", "));
    println!("  ✓ Configuration valid");

    Ok(())
}

/// Build the engine `run` would use, plus the workload's request names.
fn build_engine(config: &Config) -> Result<(Engine, Vec<String>)> {
    let options = config.into_options()?;
    let workload_config = config
        .workload
        .as_ref()
        .ok_or_else(|| ConfigError::Workload("no workload configured".to_string()))?;
    let workload = HttpWorkload::new(workload_config)?;
    let requests = workload.request_names().map(str::to_string).collect();
    Ok((Engine::new(options, Arc::new(workload))?, requests))
}
