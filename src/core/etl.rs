use crate::core::Pipeline;
use crate::domain::model::RunSummary;
use crate::utils::error::Result;
use std::time::Instant;

pub struct EtlEngine<P: Pipeline> {
    pipeline: P,
}

impl<P: Pipeline> EtlEngine<P> {
    pub fn new(pipeline: P) -> Self {
        Self { pipeline }
    }

    pub fn pipeline(&self) -> &P {
        &self.pipeline
    }

    pub fn into_pipeline(self) -> P {
        self.pipeline
    }

    /// Runs extract → transform → load. A fatal error is reported to the
    /// pipeline before it is returned.
    pub async fn run(&self) -> Result<RunSummary> {
        let started = Instant::now();
        match self.run_stages().await {
            Ok(mut summary) => {
                summary.elapsed = started.elapsed();
                tracing::info!(
                    output = %summary.output_path.display(),
                    written = summary.rows_written,
                    failed = summary.rows_failed(),
                    aborted = summary.aborted,
                    elapsed_ms = summary.elapsed.as_millis() as u64,
                    "🎉 ETL run finished"
                );
                Ok(summary)
            }
            Err(e) => {
                self.pipeline.record_fatal(&e).await;
                Err(e)
            }
        }
    }

    async fn run_stages(&self) -> Result<RunSummary> {
        tracing::info!("🚀 Starting ETL process...");

        // Extract
        let raw_data = self.pipeline.extract().await?;
        tracing::info!(rows = raw_data.len(), columns = raw_data.columns.len(), "📥 Extracted records");

        // Transform
        let transformed = self.pipeline.transform(raw_data).await?;
        tracing::info!(
            processed = transformed.processed_rows,
            staged = transformed.sink.rows_written(),
            failed = transformed.failures.total(),
            "🔄 Transformed records"
        );

        // Load
        let summary = self.pipeline.load(transformed).await?;
        tracing::info!(path = %summary.output_path.display(), "💾 Output saved");

        Ok(summary)
    }
}
