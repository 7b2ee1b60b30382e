use clap::Parser;
use llm_csv_etl::core::ConfigProvider;
use llm_csv_etl::domain::model::RunSummary;
use llm_csv_etl::utils::{logger, validation::Validate};
use llm_csv_etl::{
    dry_run, CliConfig, DryRunReport, EtlEngine, EtlError, JobConfig, LlmPipeline,
    OpenRouterClient, ResponseCache, RunLog,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// 128 + SIGINT
const INTERRUPTED_EXIT_CODE: i32 = 130;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env 只補上尚未設定的環境變數
    dotenv::dotenv().ok();
    let cli = CliConfig::parse();

    let job = match cli.resolve() {
        Ok(job) => job,
        Err(e) => {
            eprintln!("❌ {}", e.user_friendly_message());
            eprintln!("💡 建議: {}", e.recovery_suggestion());
            std::process::exit(e.exit_code());
        }
    };

    // 初始化日誌
    if job.log_json() {
        logger::init_json_logger(cli.verbose);
    } else {
        logger::init_cli_logger(cli.verbose);
    }
    tracing::info!("Starting llm-csv-etl");
    if cli.verbose {
        tracing::debug!("CLI config: {:?}", cli);
    }

    // 驗證配置
    if let Err(e) = job.validate() {
        fail(&e);
    }
    display_config_summary(&job, &cli);

    if cli.dry_run {
        tracing::info!("🔍 DRY RUN MODE - no API calls, no output file");
        match dry_run(&job) {
            Ok(report) => display_dry_run(&report),
            Err(e) => fail(&e),
        }
        return Ok(());
    }

    let Some(api_key) = job.api_key() else {
        fail(&EtlError::MissingConfigError {
            field: "model.api_key (or OPENROUTER_API_KEY)".to_string(),
        });
    };

    let client = match OpenRouterClient::new(job.api_url(), api_key, job.timeout()) {
        Ok(client) => client
            .with_attribution(job.site_url(), job.site_name())
            .with_request_interval(job.request_interval()),
        Err(e) => fail(&e),
    };

    let run_log = match job.run_log_path() {
        Some(path) => RunLog::open(path).unwrap_or_else(|e| fail(&e)),
        None => RunLog::in_memory(),
    };
    let run_log_path = job.run_log_path().map(|p| p.to_path_buf());
    let mut cache = job
        .cache_dir()
        .map(ResponseCache::open)
        .transpose()
        .unwrap_or_else(|e| fail(&e));
    if let Some(cache) = cache.as_mut() {
        if cli.clear_cache {
            cache.clear().unwrap_or_else(|e| fail(&e));
        }
        let info = cache.info();
        println!("📦 Cache: {} entries, {} bytes ({})", info.entries, info.file_bytes, info.path.display());
    } else if cli.clear_cache {
        tracing::warn!("⚠️ --clear-cache given without a cache directory, nothing to clear");
    }

    // 第一次 Ctrl-C 只停止接收新列，已完成的列仍會寫出；第二次立即結束
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if flag.swap(true, Ordering::SeqCst) {
                tracing::error!("🛑 Second interrupt, exiting without committing output");
                eprintln!("🛑 Interrupted");
                std::process::exit(INTERRUPTED_EXIT_CODE);
            }
            tracing::warn!("🛑 Interrupt received, finishing the current row (press Ctrl-C again to exit now)");
        }
    });

    let mut pipeline = match LlmPipeline::new(client, job, run_log) {
        Ok(pipeline) => pipeline.with_cancellation(cancel),
        Err(e) => fail(&e),
    };
    if let Some(cache) = cache {
        pipeline = pipeline.with_cache(cache);
    }

    let engine = EtlEngine::new(pipeline);
    match engine.run().await {
        Ok(summary) => {
            display_run_summary(&summary);
            if let Some(path) = run_log_path {
                println!("📝 Run log: {}", path.display());
            }
        }
        Err(e) => fail(&e),
    }

    Ok(())
}

fn fail(e: &EtlError) -> ! {
    // 記錄詳細錯誤信息
    tracing::error!(
        "❌ ETL process failed: {} (Category: {:?}, Severity: {:?})",
        e,
        e.category(),
        e.severity()
    );
    tracing::error!("💡 Recovery suggestion: {}", e.recovery_suggestion());

    // 輸出用戶友好的錯誤信息
    eprintln!("❌ {}", e.user_friendly_message());
    eprintln!("💡 建議: {}", e.recovery_suggestion());

    // 根據錯誤嚴重程度決定退出碼
    std::process::exit(e.exit_code());
}

fn display_config_summary(job: &JobConfig, cli: &CliConfig) {
    let options = job.generation_options();
    println!("📋 Configuration Summary:");
    println!("  Job: {}", job.job_name());
    println!("  Input: {}", job.input_path().display());
    println!("  Output: {}", job.output_path().display());
    println!("  Model: {} (temperature {}, max tokens {})", options.model, options.temperature, options.max_tokens);
    println!("  Fields: {} ({:?})", job.output_fields().join(", "), job.response_format());
    if let Some(limit) = job.row_limit() {
        println!("  Row limit: {}", limit);
    }
    if let Some(dir) = job.cache_dir() {
        println!("  Cache: {}", dir.display());
    }
    if cli.dry_run {
        println!("  🔍 DRY RUN MODE ENABLED");
    }
    println!();
}

fn display_dry_run(report: &DryRunReport) {
    println!("🔍 Dry Run Analysis:");
    println!("  Rows: {}", report.total_rows);
    println!("  Output header: {}", report.output_header.join(", "));
    println!("  Prompts built: {}", report.prompts_built);
    if !report.missing_columns.is_empty() {
        println!("  ⚠️ Columns missing from input: {}", report.missing_columns.join(", "));
    }
    for (row, err) in &report.template_failures {
        println!("  ❌ row {}: {}", row, err);
    }
    if let Some(prompt) = &report.first_prompt {
        println!();
        println!("📝 First prompt:");
        println!("{}", prompt);
    }
    println!();
    println!("Would write: {}", report.output_path.display());
}

fn display_run_summary(summary: &RunSummary) {
    if summary.aborted {
        println!("⚠️ ETL process stopped early on request");
    } else {
        println!("✅ ETL process completed successfully!");
    }
    println!("📁 Output saved to: {}", summary.output_path.display());
    println!(
        "📊 Rows: {} read, {} processed, {} written, {} dropped (template {}, generation {}, parse {})",
        summary.total_rows,
        summary.processed_rows,
        summary.rows_written,
        summary.rows_failed(),
        summary.failures.template,
        summary.failures.generation,
        summary.failures.parse
    );
    println!(
        "💰 Tokens: {} prompt + {} completion = {} | API calls {} | cache hits {} | est. cost ${:.4}",
        summary.usage.prompt_tokens,
        summary.usage.completion_tokens,
        summary.usage.total_tokens,
        summary.usage.api_calls,
        summary.usage.cache_hits,
        summary.usage.cost_usd
    );
    println!("⏱️ Elapsed: {:.1}s", summary.elapsed.as_secs_f64());
}
