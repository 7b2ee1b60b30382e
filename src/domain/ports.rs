use crate::core::pipeline::TransformResult;
use crate::core::retry::RetryPolicy;
use crate::domain::model::{
    Dataset, Generation, GenerationOptions, ResponseFormat, RunSummary,
};
use crate::utils::error::{EtlError, GenerationError, Result};
use crate::utils::stats::Pricing;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

/// Text generation backend. Repeated calls with the same prompt may return different text.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> std::result::Result<Generation, GenerationError>;
}

#[async_trait]
impl<T: LlmClient + ?Sized> LlmClient for Box<T> {
    async fn generate(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> std::result::Result<Generation, GenerationError> {
        (**self).generate(prompt, options).await
    }
}

#[async_trait]
impl<T: LlmClient + ?Sized> LlmClient for Arc<T> {
    async fn generate(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> std::result::Result<Generation, GenerationError> {
        (**self).generate(prompt, options).await
    }
}

pub trait ConfigProvider: Send + Sync {
    fn input_path(&self) -> &Path;
    fn output_path(&self) -> &Path;
    fn input_delimiter(&self) -> u8;
    fn output_delimiter(&self) -> u8;
    fn row_limit(&self) -> Option<usize>;
    fn template(&self) -> &str;
    fn strict_fields(&self) -> bool;
    fn output_fields(&self) -> &[String];
    fn response_format(&self) -> ResponseFormat;
    fn generation_options(&self) -> GenerationOptions;
    fn retry_policy(&self) -> RetryPolicy;
    fn pricing(&self) -> Pricing;
}

#[async_trait]
pub trait Pipeline: Send + Sync {
    async fn extract(&self) -> Result<Dataset>;
    async fn transform(&self, data: Dataset) -> Result<TransformResult>;
    async fn load(&self, result: TransformResult) -> Result<RunSummary>;

    /// Called once when the run aborts.
    async fn record_fatal(&self, _error: &EtlError) {}
}
