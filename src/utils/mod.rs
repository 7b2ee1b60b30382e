pub mod error;
pub mod logger;
pub mod run_log;
pub mod stats;
pub mod validation;
