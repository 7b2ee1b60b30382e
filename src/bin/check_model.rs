use anyhow::Context;
use clap::Parser;
use llm_csv_etl::core::{ConfigProvider, LlmClient};
use llm_csv_etl::utils::logger;
use llm_csv_etl::{JobConfig, OpenRouterClient};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "check_model")]
#[command(about = "Send one prompt to the configured model and print the reply")]
struct Args {
    /// Job file to take model settings from
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the model id
    #[arg(long)]
    model: Option<String>,

    #[arg(long, default_value = "Say hello in one word")]
    prompt: String,

    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    logger::init_cli_logger(args.verbose);

    let mut job = match &args.config {
        Some(path) => JobConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => JobConfig::default(),
    };
    if let Some(model) = args.model {
        job.model.name = Some(model);
    }

    let api_key = job
        .api_key()
        .context("no API key: set OPENROUTER_API_KEY or model.api_key")?;
    let client = OpenRouterClient::new(job.api_url(), api_key, job.timeout())?
        .with_attribution(job.site_url(), job.site_name());
    let options = job.generation_options();

    println!("🔌 Model: {}", options.model);
    println!("📡 Endpoint: {}", client.api_url());
    println!("📝 Prompt: {}", args.prompt);

    let generation = client
        .generate(&args.prompt, &options)
        .await
        .with_context(|| format!("model '{}' did not answer", options.model))?;

    println!("✅ Reply: {}", generation.text.trim());
    if let Some(usage) = generation.usage {
        let cost = job.pricing().cost(&usage);
        println!(
            "📊 Tokens: {} prompt + {} completion = {} (est. ${:.6})",
            usage.prompt_tokens, usage.completion_tokens, usage.total_tokens, cost
        );
    }

    Ok(())
}
