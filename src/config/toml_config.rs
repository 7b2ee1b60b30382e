use crate::adapters::openrouter::{DEFAULT_API_URL, DEFAULT_TIMEOUT};
use crate::core::prompt::PromptTemplate;
use crate::core::retry::{RetryPolicy, MAX_ATTEMPTS_LIMIT};
use crate::core::ConfigProvider;
use crate::domain::model::{GenerationOptions, ResponseFormat};
use crate::utils::error::{EtlError, Result};
use crate::utils::stats::Pricing;
use crate::utils::validation::{
    validate_delimiter, validate_field_names, validate_non_empty_string, validate_path,
    validate_positive_number, validate_range, validate_url, Validate,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_INPUT_PATH: &str = "input/input.csv";
pub const DEFAULT_OUTPUT_PATH: &str = "output/output.csv";
pub const DEFAULT_MODEL: &str = "google/gemini-2.5-flash";
pub const DEFAULT_TEMPERATURE: f32 = 1.0;
pub const DEFAULT_MAX_TOKENS: u32 = 4096;
pub const API_KEY_ENV: &str = "OPENROUTER_API_KEY";

/// A job file: which CSV to read, how to prompt, what to extract, where to write.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobConfig {
    #[serde(default)]
    pub job: JobSection,
    #[serde(default)]
    pub input: InputConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub prompt: PromptConfig,
    #[serde(default)]
    pub response: ResponseConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobSection {
    pub name: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputConfig {
    pub path: Option<PathBuf>,
    pub delimiter: Option<char>,
    /// Only the first N data rows are processed.
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputConfig {
    pub path: Option<PathBuf>,
    pub delimiter: Option<char>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptConfig {
    pub template: Option<String>,
    /// Relative paths are resolved against the job file's directory.
    pub template_file: Option<PathBuf>,
    pub strict_fields: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseConfig {
    #[serde(default)]
    pub fields: Vec<String>,
    pub format: Option<ResponseFormat>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name: Option<String>,
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub timeout_seconds: Option<u64>,
    /// Minimum time between two requests.
    pub request_interval_ms: Option<u64>,
    pub site_url: Option<String>,
    pub site_name: Option<String>,
    pub input_cost_per_million: Option<f64>,
    pub output_cost_per_million: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// JSON lines file receiving one entry per row.
    pub run_log: Option<PathBuf>,
    pub json: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Setting a directory enables the response cache.
    pub dir: Option<PathBuf>,
}

impl JobConfig {
    /// 從 TOML 檔案載入配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            EtlError::config(format!("cannot read job file '{}': {}", path.display(), e))
        })?;
        let mut config = Self::from_toml_str(&content)?;

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.load_template_file(base_dir)?;
        Ok(config)
    }

    /// 從 TOML 字串解析配置
    pub fn from_toml_str(content: &str) -> Result<Self> {
        // 處理環境變數替換
        let processed_content = Self::substitute_env_vars(content)?;

        toml::from_str(&processed_content).map_err(|e| EtlError::ConfigValidationError {
            field: "toml_parsing".to_string(),
            message: format!("TOML parsing error: {}", e),
        })
    }

    /// 替換環境變數 (例如 ${OPENROUTER_API_KEY})，未設定的變數保持原樣
    fn substitute_env_vars(content: &str) -> Result<String> {
        use regex::Regex;
        let re = Regex::new(r"\$\{([^}]+)\}")
            .map_err(|e| EtlError::config(format!("invalid substitution pattern: {}", e)))?;

        let result = re.replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            std::env::var(var_name).unwrap_or_else(|_| format!("${{{}}}", var_name))
        });

        Ok(result.to_string())
    }

    /// Reads `prompt.template_file` into `prompt.template`.
    pub fn load_template_file(&mut self, base_dir: &Path) -> Result<()> {
        let Some(file) = &self.prompt.template_file else {
            return Ok(());
        };
        if self.prompt.template.is_some() {
            return Err(EtlError::ConfigValidationError {
                field: "prompt".to_string(),
                message: "set either 'template' or 'template_file', not both".to_string(),
            });
        }

        let path = if file.is_absolute() {
            file.clone()
        } else {
            base_dir.join(file)
        };
        let template = std::fs::read_to_string(&path).map_err(|e| {
            EtlError::config(format!(
                "cannot read template file '{}': {}",
                path.display(),
                e
            ))
        })?;
        tracing::debug!(path = %path.display(), "template loaded");
        self.prompt.template = Some(template);
        Ok(())
    }

    pub fn job_name(&self) -> &str {
        self.job.name.as_deref().unwrap_or("llm-csv-etl")
    }

    pub fn model_name(&self) -> &str {
        self.model.name.as_deref().unwrap_or(DEFAULT_MODEL)
    }

    pub fn api_url(&self) -> &str {
        self.model.api_url.as_deref().unwrap_or(DEFAULT_API_URL)
    }

    /// `model.api_key`, falling back to `OPENROUTER_API_KEY`. An unresolved
    /// `${VAR}` placeholder counts as unset.
    pub fn api_key(&self) -> Option<String> {
        self.model
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty() && !k.contains("${"))
            .or_else(|| {
                std::env::var(API_KEY_ENV)
                    .ok()
                    .filter(|k| !k.trim().is_empty())
            })
    }

    pub fn timeout(&self) -> Duration {
        self.model
            .timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TIMEOUT)
    }

    pub fn request_interval(&self) -> Duration {
        Duration::from_millis(self.model.request_interval_ms.unwrap_or(0))
    }

    pub fn site_url(&self) -> Option<String> {
        self.model.site_url.clone()
    }

    pub fn site_name(&self) -> Option<String> {
        self.model.site_name.clone()
    }

    pub fn run_log_path(&self) -> Option<&Path> {
        self.logging.run_log.as_deref()
    }

    pub fn log_json(&self) -> bool {
        self.logging.json.unwrap_or(false)
    }

    pub fn cache_dir(&self) -> Option<&Path> {
        self.cache.dir.as_deref()
    }

    /// 驗證配置的合理性
    pub fn validate_config(&self) -> Result<()> {
        validate_path("input.path", &self.input_path().to_string_lossy())?;
        validate_path("output.path", &self.output_path().to_string_lossy())?;
        if self.input_path() == self.output_path() {
            return Err(EtlError::InvalidConfigValueError {
                field: "output.path".to_string(),
                value: self.output_path().display().to_string(),
                reason: "Output must not overwrite the input file".to_string(),
            });
        }
        if let Some(limit) = self.input.limit {
            validate_positive_number("input.limit", limit, 1)?;
        }
        validate_delimiter("input.delimiter", self.input.delimiter.unwrap_or(','))?;
        validate_delimiter("output.delimiter", self.output.delimiter.unwrap_or(','))?;

        let template = self.prompt.template.as_deref().unwrap_or_default();
        validate_non_empty_string("prompt.template", template)?;
        PromptTemplate::compile(template)?;

        validate_field_names("response.fields", &self.response.fields)?;

        validate_non_empty_string("model.name", self.model_name())?;
        validate_url("model.api_url", self.api_url())?;
        validate_range("model.temperature", self.temperature(), 0.0, 2.0)?;
        validate_positive_number("model.max_tokens", self.max_tokens() as usize, 1)?;
        validate_positive_number("model.timeout_seconds", self.timeout().as_secs() as usize, 1)?;
        let pricing = self.pricing();
        validate_range("model.input_cost_per_million", pricing.input_per_million, 0.0, f64::MAX)?;
        validate_range("model.output_cost_per_million", pricing.output_per_million, 0.0, f64::MAX)?;

        let retry = self.retry_policy();
        validate_range("retry.max_attempts", retry.max_attempts, 1, MAX_ATTEMPTS_LIMIT)?;
        if retry.base_delay > retry.max_delay {
            return Err(EtlError::InvalidConfigValueError {
                field: "retry.base_delay_ms".to_string(),
                value: retry.base_delay.as_millis().to_string(),
                reason: "Base delay cannot exceed retry.max_delay_ms".to_string(),
            });
        }

        Ok(())
    }

    fn temperature(&self) -> f32 {
        self.model.temperature.unwrap_or(DEFAULT_TEMPERATURE)
    }

    fn max_tokens(&self) -> u32 {
        self.model.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)
    }
}

impl ConfigProvider for JobConfig {
    fn input_path(&self) -> &Path {
        self.input
            .path
            .as_deref()
            .unwrap_or(Path::new(DEFAULT_INPUT_PATH))
    }

    fn output_path(&self) -> &Path {
        self.output
            .path
            .as_deref()
            .unwrap_or(Path::new(DEFAULT_OUTPUT_PATH))
    }

    fn input_delimiter(&self) -> u8 {
        validate_delimiter("input.delimiter", self.input.delimiter.unwrap_or(',')).unwrap_or(b',')
    }

    fn output_delimiter(&self) -> u8 {
        validate_delimiter("output.delimiter", self.output.delimiter.unwrap_or(','))
            .unwrap_or(b',')
    }

    fn row_limit(&self) -> Option<usize> {
        self.input.limit
    }

    fn template(&self) -> &str {
        self.prompt.template.as_deref().unwrap_or_default()
    }

    fn strict_fields(&self) -> bool {
        self.prompt.strict_fields.unwrap_or(true)
    }

    fn output_fields(&self) -> &[String] {
        &self.response.fields
    }

    fn response_format(&self) -> ResponseFormat {
        self.response.format.unwrap_or_default()
    }

    fn generation_options(&self) -> GenerationOptions {
        GenerationOptions {
            model: self.model_name().to_string(),
            temperature: self.temperature(),
            max_tokens: self.max_tokens(),
            json_mode: self.response_format() == ResponseFormat::Json,
        }
    }

    fn retry_policy(&self) -> RetryPolicy {
        let defaults = RetryPolicy::default();
        RetryPolicy {
            max_attempts: self.retry.max_attempts.unwrap_or(defaults.max_attempts),
            base_delay: self
                .retry
                .base_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.base_delay),
            max_delay: self
                .retry
                .max_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_delay),
        }
    }

    fn pricing(&self) -> Pricing {
        let defaults = Pricing::default();
        Pricing {
            input_per_million: self
                .model
                .input_cost_per_million
                .unwrap_or(defaults.input_per_million),
            output_per_million: self
                .model
                .output_cost_per_million
                .unwrap_or(defaults.output_per_million),
        }
    }
}

impl Validate for JobConfig {
    fn validate(&self) -> Result<()> {
        self.validate_config()
    }
}
