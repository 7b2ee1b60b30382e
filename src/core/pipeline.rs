use crate::adapters::cache::{CacheEntry, ResponseCache};
use crate::core::csv_io::{output_header, read_dataset, StagedCsvWriter};
use crate::core::prompt::{PromptBuilder, PromptTemplate};
use crate::core::response::ResponseParser;
use crate::core::retry::RetryPolicy;
use crate::core::{ConfigProvider, LlmClient, Pipeline};
use crate::domain::model::{
    Dataset, FailureCounts, Generation, GenerationOptions, OutputRecord, RowRecord, RowState,
    RunSummary,
};
use crate::utils::error::{EtlError, Result, RowError, TemplateError};
use crate::utils::run_log::{RowLogEntry, RunLog};
use crate::utils::stats::{Pricing, UsageStats};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Rows that made it through transform, staged and waiting for commit.
pub struct TransformResult {
    pub sink: StagedCsvWriter,
    pub total_rows: usize,
    pub processed_rows: usize,
    pub failures: FailureCounts,
    pub usage: UsageStats,
    pub aborted: bool,
}

/// Prompt → generate → parse → write, one row at a time.
pub struct LlmPipeline<L: LlmClient, C: ConfigProvider> {
    client: L,
    config: C,
    prompts: PromptBuilder,
    parser: ResponseParser,
    options: GenerationOptions,
    retry: RetryPolicy,
    pricing: Pricing,
    run_log: Mutex<RunLog>,
    cache: Option<Mutex<ResponseCache>>,
    cancel: Arc<AtomicBool>,
}

impl<L: LlmClient, C: ConfigProvider> LlmPipeline<L, C> {
    /// Compiles the template and output schema. Fails before any input is read.
    pub fn new(client: L, config: C, run_log: RunLog) -> Result<Self> {
        let template = PromptTemplate::compile(config.template())?;
        let prompts = PromptBuilder::new(template, config.strict_fields());
        let parser = ResponseParser::new(config.output_fields().to_vec(), config.response_format())?;

        Ok(Self {
            options: config.generation_options(),
            retry: config.retry_policy(),
            pricing: config.pricing(),
            client,
            config,
            prompts,
            parser,
            run_log: Mutex::new(run_log),
            cache: None,
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Rows are no longer started once `flag` is set.
    pub fn with_cancellation(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = flag;
        self
    }

    pub fn with_cache(mut self, cache: ResponseCache) -> Self {
        self.cache = Some(Mutex::new(cache));
        self
    }

    pub fn cancellation_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn config(&self) -> &C {
        &self.config
    }

    pub fn client(&self) -> &L {
        &self.client
    }

    pub async fn log_entries(&self) -> Vec<RowLogEntry> {
        self.run_log.lock().await.entries().to_vec()
    }

    pub fn into_run_log(self) -> RunLog {
        self.run_log.into_inner()
    }

    fn header(&self, columns: &[String]) -> Result<Vec<String>> {
        output_header(self.config.input_path(), columns, self.parser.fields())
    }

    async fn process_row(
        &self,
        row: &RowRecord,
        usage: &mut UsageStats,
    ) -> std::result::Result<OutputRecord, RowError> {
        tracing::debug!(row = row.index, state = ?RowState::Pending, "row started");

        let prompt = self.prompts.build(row)?;
        tracing::debug!(row = row.index, state = ?RowState::Prompted, prompt_len = prompt.len(), "prompt built");

        let cache_key = self
            .cache
            .as_ref()
            .map(|_| ResponseCache::key(&prompt, &self.options));
        let generation = self.generate(&prompt, cache_key.as_deref(), usage).await?;
        tracing::debug!(
            row = row.index,
            state = ?RowState::Generated,
            cached = generation.cached,
            response_len = generation.text.len(),
            "response received"
        );

        let fields = self.parser.parse(&generation.text)?;
        tracing::debug!(row = row.index, state = ?RowState::Parsed, fields = fields.len(), "response parsed");

        // 只快取能成功解析的回應
        if let (Some(key), false) = (cache_key, generation.cached) {
            self.store_in_cache(key, &generation).await;
        }

        Ok(OutputRecord::from_row(row, fields))
    }

    async fn generate(
        &self,
        prompt: &str,
        cache_key: Option<&str>,
        usage: &mut UsageStats,
    ) -> std::result::Result<Generation, RowError> {
        if let (Some(cache), Some(key)) = (&self.cache, cache_key) {
            if let Some(entry) = cache.lock().await.get(key) {
                usage.record_cache_hit();
                return Ok(Generation {
                    text: entry.text.clone(),
                    usage: entry.usage,
                    cached: true,
                });
            }
        }

        let calls = &AtomicU32::new(0);
        let client = &self.client;
        let options = &self.options;
        let result = self
            .retry
            .run(&self.cancel, move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                client.generate(prompt, options)
            })
            .await;
        usage.record_calls(u64::from(calls.load(Ordering::SeqCst)));

        let generation = result?;
        if let Some(tokens) = &generation.usage {
            usage.record_usage(tokens, &self.pricing);
        }
        Ok(generation)
    }

    async fn store_in_cache(&self, key: String, generation: &Generation) {
        let Some(cache) = &self.cache else {
            return;
        };
        let entry = CacheEntry {
            text: generation.text.clone(),
            usage: generation.usage,
            model: self.options.model.clone(),
            stored_at: Utc::now(),
        };
        cache.lock().await.store(key, entry);
    }

    async fn flush_cache(&self) {
        let Some(cache) = &self.cache else {
            return;
        };
        if let Err(e) = cache.lock().await.flush() {
            tracing::warn!(error = %e, "⚠️ could not save response cache");
        }
    }
}

#[async_trait::async_trait]
impl<L: LlmClient, C: ConfigProvider> Pipeline for LlmPipeline<L, C> {
    async fn extract(&self) -> Result<Dataset> {
        let input = self.config.input_path();
        tracing::debug!(path = %input.display(), "reading input");

        let dataset = read_dataset(
            input,
            self.config.input_delimiter(),
            self.config.row_limit(),
        )?;
        self.header(&dataset.columns)?;

        let missing = self.prompts.missing_columns(&dataset.columns);
        if !missing.is_empty() {
            tracing::warn!(
                columns = ?missing,
                "⚠️ template references columns not in the input header; every row will fail"
            );
        }

        Ok(dataset)
    }

    async fn transform(&self, data: Dataset) -> Result<TransformResult> {
        let header = self.header(&data.columns)?;
        let mut sink = StagedCsvWriter::create(
            self.config.output_path(),
            &header,
            self.config.output_delimiter(),
        )?;

        let total_rows = data.len();
        let mut processed_rows = 0;
        let mut failures = FailureCounts::default();
        let mut usage = UsageStats::default();
        let mut aborted = false;

        for row in &data.rows {
            if self.cancel.load(Ordering::SeqCst) {
                tracing::warn!(
                    processed = processed_rows,
                    remaining = total_rows - processed_rows,
                    "🛑 abort requested, no further rows will be processed"
                );
                aborted = true;
                break;
            }

            let outcome = self.process_row(row, &mut usage).await;
            let mut log = self.run_log.lock().await;
            match outcome {
                Ok(record) => {
                    sink.append(&record)?;
                    log.row_written(row.index)?;
                }
                Err(err) => {
                    failures.record(&err);
                    log.row_failed(row.index, &err)?;
                }
            }
            processed_rows += 1;
        }

        Ok(TransformResult {
            sink,
            total_rows,
            processed_rows,
            failures,
            usage,
            aborted,
        })
    }

    async fn load(&self, result: TransformResult) -> Result<RunSummary> {
        let rows_written = result.sink.rows_written();
        tracing::debug!(rows = rows_written, target = %result.sink.target().display(), "committing output");
        self.flush_cache().await;
        let output_path = result.sink.commit()?;

        Ok(RunSummary {
            output_path,
            total_rows: result.total_rows,
            processed_rows: result.processed_rows,
            rows_written,
            failures: result.failures,
            aborted: result.aborted,
            usage: result.usage,
            elapsed: Duration::ZERO,
        })
    }

    async fn record_fatal(&self, error: &EtlError) {
        self.flush_cache().await;
        self.run_log.lock().await.fatal(error);
    }
}

/// What a run would do, computed without calling the model or writing output.
#[derive(Debug, Clone)]
pub struct DryRunReport {
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub total_rows: usize,
    pub output_header: Vec<String>,
    pub missing_columns: Vec<String>,
    pub prompts_built: usize,
    pub template_failures: Vec<(usize, TemplateError)>,
    pub first_prompt: Option<String>,
}

pub fn dry_run(config: &impl ConfigProvider) -> Result<DryRunReport> {
    let template = PromptTemplate::compile(config.template())?;
    let prompts = PromptBuilder::new(template, config.strict_fields());
    let parser = ResponseParser::new(config.output_fields().to_vec(), config.response_format())?;

    let dataset = read_dataset(
        config.input_path(),
        config.input_delimiter(),
        config.row_limit(),
    )?;
    let header = output_header(config.input_path(), &dataset.columns, parser.fields())?;

    let mut prompts_built = 0;
    let mut template_failures = Vec::new();
    let mut first_prompt = None;
    for row in &dataset.rows {
        match prompts.build(row) {
            Ok(prompt) => {
                prompts_built += 1;
                first_prompt.get_or_insert(prompt);
            }
            Err(e) => template_failures.push((row.index, e)),
        }
    }

    Ok(DryRunReport {
        input_path: config.input_path().to_path_buf(),
        output_path: config.output_path().to_path_buf(),
        total_rows: dataset.len(),
        output_header: header,
        missing_columns: prompts.missing_columns(&dataset.columns),
        prompts_built,
        template_failures,
        first_prompt,
    })
}
