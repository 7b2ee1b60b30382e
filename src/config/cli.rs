use crate::config::toml_config::JobConfig;
use crate::domain::model::ResponseFormat;
use crate::utils::error::{EtlError, Result};
use clap::Parser;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Parser)]
#[command(name = "llm-csv-etl")]
#[command(about = "Generate new CSV columns by sending every row through an LLM", version)]
pub struct CliConfig {
    /// Job file (TOML). Command line flags override its values.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[arg(short, long)]
    pub input: Option<PathBuf>,

    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Process only the first N rows
    #[arg(long)]
    pub limit: Option<usize>,

    /// OpenRouter model id, e.g. google/gemini-2.5-flash
    #[arg(long)]
    pub model: Option<String>,

    /// Prompt template with {column} placeholders
    #[arg(long, conflicts_with = "template_file")]
    pub template: Option<String>,

    #[arg(long)]
    pub template_file: Option<PathBuf>,

    /// Generated column names, comma separated
    #[arg(long, value_delimiter = ',')]
    pub fields: Vec<String>,

    #[arg(long, value_enum)]
    pub format: Option<ResponseFormat>,

    /// Append one JSON line per row to this file
    #[arg(long)]
    pub run_log: Option<PathBuf>,

    /// Enable the response cache in this directory
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Empty the response cache before running
    #[arg(long)]
    pub clear_cache: bool,

    /// Build every prompt and report, without calling the API or writing output
    #[arg(long)]
    pub dry_run: bool,

    #[arg(short, long, help = "Enable verbose output")]
    pub verbose: bool,

    /// Emit logs as JSON
    #[arg(long)]
    pub log_json: bool,
}

impl CliConfig {
    /// Loads the job file (if any) and applies command line overrides.
    pub fn resolve(&self) -> Result<JobConfig> {
        let mut job = match &self.config {
            Some(path) => {
                tracing::debug!(path = %path.display(), "loading job file");
                JobConfig::from_file(path)?
            }
            None => {
                if self.template.is_none() && self.template_file.is_none() {
                    return Err(EtlError::MissingConfigError {
                        field: "--template or --template-file (or --config)".to_string(),
                    });
                }
                if self.fields.is_empty() {
                    return Err(EtlError::MissingConfigError {
                        field: "--fields (or --config)".to_string(),
                    });
                }
                JobConfig::default()
            }
        };

        if let Some(input) = &self.input {
            job.input.path = Some(input.clone());
        }
        if let Some(output) = &self.output {
            job.output.path = Some(output.clone());
        }
        if let Some(limit) = self.limit {
            job.input.limit = Some(limit);
        }
        if let Some(model) = &self.model {
            job.model.name = Some(model.clone());
        }
        if let Some(template) = &self.template {
            job.prompt.template = Some(template.clone());
            job.prompt.template_file = None;
        }
        if let Some(file) = &self.template_file {
            job.prompt.template = None;
            job.prompt.template_file = Some(file.clone());
            // 命令列給的路徑相對於目前目錄
            job.load_template_file(Path::new("."))?;
        }
        if !self.fields.is_empty() {
            job.response.fields = self.fields.iter().map(|f| f.trim().to_string()).collect();
        }
        if let Some(format) = self.format {
            job.response.format = Some(format);
        }
        if let Some(run_log) = &self.run_log {
            job.logging.run_log = Some(run_log.clone());
        }
        if let Some(cache_dir) = &self.cache_dir {
            job.cache.dir = Some(cache_dir.clone());
        }
        if self.log_json {
            job.logging.json = Some(true);
        }

        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ConfigProvider;
    use tempfile::TempDir;

    fn parse(args: &[&str]) -> CliConfig {
        CliConfig::try_parse_from(std::iter::once("llm-csv-etl").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn test_flags_only() {
        let cli = parse(&[
            "--input",
            "topics.csv",
            "--template",
            "Story about {topic}",
            "--fields",
            "title,body",
            "--limit",
            "2",
        ]);

        let job = cli.resolve().unwrap();

        assert_eq!(job.input_path(), Path::new("topics.csv"));
        assert_eq!(job.template(), "Story about {topic}");
        assert_eq!(job.output_fields(), &["title".to_string(), "body".to_string()]);
        assert_eq!(job.row_limit(), Some(2));
    }

    #[test]
    fn test_template_and_fields_required_without_job_file() {
        assert!(matches!(
            parse(&["--fields", "title"]).resolve(),
            Err(EtlError::MissingConfigError { .. })
        ));
        assert!(matches!(
            parse(&["--template", "{a}"]).resolve(),
            Err(EtlError::MissingConfigError { .. })
        ));
    }

    #[test]
    fn test_flags_override_job_file() {
        let dir = TempDir::new().unwrap();
        let job_path = dir.path().join("job.toml");
        std::fs::write(
            &job_path,
            "[input]\npath = \"a.csv\"\n[prompt]\ntemplate = \"{x}\"\n[response]\nfields = [\"y\"]\n[model]\nname = \"m1\"\n",
        )
        .unwrap();
        let job_arg = job_path.to_string_lossy().to_string();

        let job = parse(&[
            "--config",
            &job_arg,
            "--model",
            "m2",
            "--format",
            "json",
            "--cache-dir",
            "cache",
            "--log-json",
        ])
        .resolve()
        .unwrap();

        assert_eq!(job.input_path(), Path::new("a.csv"));
        assert_eq!(job.model_name(), "m2");
        assert_eq!(job.response_format(), ResponseFormat::Json);
        assert_eq!(job.cache_dir(), Some(Path::new("cache")));
        assert!(job.log_json());
    }

    #[test]
    fn test_clear_cache_flag() {
        let cli = parse(&["--template", "{a}", "--fields", "b", "--clear-cache"]);
        assert!(cli.clear_cache);
        assert!(!parse(&["--template", "{a}", "--fields", "b"]).clear_cache);
    }

    #[test]
    fn test_template_and_template_file_conflict() {
        let result = CliConfig::try_parse_from([
            "llm-csv-etl",
            "--template",
            "{a}",
            "--template-file",
            "t.txt",
        ]);

        assert!(result.is_err());
    }
}
