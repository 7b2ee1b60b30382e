pub mod adapters;
pub mod config;
pub mod core;
pub mod domain;
pub mod utils;

#[cfg(feature = "cli")]
pub use config::CliConfig;
pub use config::JobConfig;

pub use adapters::{OpenRouterClient, ResponseCache};
pub use core::{
    etl::EtlEngine,
    pipeline::{dry_run, DryRunReport, LlmPipeline},
};
pub use utils::error::{EtlError, Result};
pub use utils::run_log::RunLog;
