pub mod csv_io;
pub mod etl;
pub mod pipeline;
pub mod prompt;
pub mod response;
pub mod retry;

pub use crate::domain::ports::{ConfigProvider, LlmClient, Pipeline};
pub use crate::utils::error::Result;
pub use pipeline::{LlmPipeline, TransformResult};
