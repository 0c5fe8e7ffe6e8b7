pub mod cli;
pub mod engine;
pub mod error;
pub mod stats;
pub mod utils;

pub use engine::{Engine, RunOptions, Stage, VuContext, Workload};
pub use error::ConfigError;
pub use stats::summary::RunSummary;
pub use utils::parse_duration_str;
