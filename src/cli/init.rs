use anyhow::Result;
use std::fs;
use std::path::Path;

const DEFAULT_CONFIG: &str = r#"# barrage run configuration
# Run with: barrage run barrage.yaml

# Ramp to 50 VUs, hold, then ramp down
stages:
  - duration: 10s
    target: 50
  - duration: 20s
    target: 50
  - duration: 5s
    target: 0

# Sleep after every iteration
pacing: 1s

# Pass/fail criteria, checked every 2s and at the end; a breach at any
# point fails the run with exit code 99
thresholds:
  http_req_duration:
    - p(90) < 1000
  checks:
    - rate > 0.99
  http_req_failed:
    - rate < 0.01
  iteration_failed:
    - rate < 0.01

workload:
  base_url: http://127.0.0.1:5000
  cookies:
    token: replace-me
  requests:
    - name: home
      url: /
      checks:
        - name: status is 200
          status: 200
        - name: response time < 1000ms
          max_duration: 1000ms
        - name: not redirected to login
          status_below: 300
    - name: products
      url: /api/product
      checks:
        - name: api status is 200
          status: 200
        - name: api response time < 1000ms
          max_duration: 1000ms
        - name: response size is sane
          body_min_len: 101
          body_max_len: 9999
"#;

/// Write a starter config to `output` (default: barrage.yaml).
pub fn run_init(output: Option<&Path>) -> Result<()> {
    let config_path = output.unwrap_or(Path::new("barrage.yaml"));

    if config_path.exists() {
        anyhow::bail!(
            "File already exists: {:?}. Remove it first or choose a different output path.",
            config_path
        );
    }

    if let Some(parent) = config_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }

    fs::write(config_path, DEFAULT_CONFIG)?;
    println!("✓ Created {}", config_path.display());

    println!("\nRun your test with:");
    println!("  barrage run {}", config_path.display());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::config::Config;
    use crate::engine::http_workload::HttpWorkload;
    use crate::engine::Engine;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_run_init_creates_config() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("load.yaml");

        run_init(Some(&path)).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("stages:"));
        assert!(content.contains("thresholds:"));
    }

    #[test]
    fn test_run_init_fails_if_exists() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("barrage.yaml");
        fs::write(&path, "existing content").unwrap();

        assert!(run_init(Some(&path)).is_err());
        assert_eq!(fs::read_to_string(&path).unwrap(), "existing content");
    }

    #[test]
    fn test_default_config_builds_an_engine() {
        let config: Config = serde_yaml::from_str(DEFAULT_CONFIG).unwrap();
        let options = config.into_options().unwrap();
        assert_eq!(options.stages.len(), 3);
        assert_eq!(options.thresholds.len(), 4);

        let workload = HttpWorkload::new(config.workload.as_ref().unwrap()).unwrap();
        let engine = Engine::new(options, Arc::new(workload)).unwrap();
        assert_eq!(engine.plan().max_target(), 50);
    }
}
