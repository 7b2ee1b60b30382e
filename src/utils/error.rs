use std::time::Duration;
use thiserror::Error;

/// Run-level errors. Anything surfacing as an `EtlError` aborts the run.
#[derive(Error, Debug)]
pub enum EtlError {
    #[error("API request failed: {0}")]
    ApiError(#[from] reqwest::Error),

    #[error("CSV processing error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Malformed input file '{path}': {message}")]
    FormatError { path: String, message: String },

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Configuration validation failed for '{field}': {message}")]
    ConfigValidationError { field: String, message: String },

    #[error("Invalid value for '{field}' ({value}): {reason}")]
    InvalidConfigValueError {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Missing required configuration: {field}")]
    MissingConfigError { field: String },

    #[error("Data processing error: {message}")]
    ProcessingError { message: String },
}

pub type Result<T> = std::result::Result<T, EtlError>;

impl From<tempfile::PersistError> for EtlError {
    fn from(err: tempfile::PersistError) -> Self {
        EtlError::IoError(err.error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Input,
    Output,
    Network,
    Processing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl EtlError {
    pub fn format(path: impl Into<String>, message: impl Into<String>) -> Self {
        EtlError::FormatError {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        EtlError::ConfigError {
            message: message.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            EtlError::ConfigError { .. }
            | EtlError::ConfigValidationError { .. }
            | EtlError::InvalidConfigValueError { .. }
            | EtlError::MissingConfigError { .. } => ErrorCategory::Configuration,
            EtlError::FormatError { .. } | EtlError::CsvError(_) => ErrorCategory::Input,
            EtlError::IoError(_) | EtlError::SerializationError(_) => ErrorCategory::Output,
            EtlError::ApiError(_) => ErrorCategory::Network,
            EtlError::ProcessingError { .. } => ErrorCategory::Processing,
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self.category() {
            ErrorCategory::Network => ErrorSeverity::Medium,
            ErrorCategory::Configuration | ErrorCategory::Input | ErrorCategory::Processing => {
                ErrorSeverity::High
            }
            ErrorCategory::Output => ErrorSeverity::Critical,
        }
    }

    /// 根據嚴重程度決定退出碼
    pub fn exit_code(&self) -> i32 {
        match self.severity() {
            ErrorSeverity::Low => 0,
            ErrorSeverity::Medium => 2,
            ErrorSeverity::High => 1,
            ErrorSeverity::Critical => 3,
        }
    }

    pub fn recovery_suggestion(&self) -> &'static str {
        match self {
            EtlError::FormatError { .. } | EtlError::CsvError(_) => {
                "Check that the input file has a header row with unique column names and that every row has the same number of fields"
            }
            EtlError::IoError(_) => {
                "Check that the input file exists and that the output directory is writable"
            }
            EtlError::MissingConfigError { .. } => {
                "Provide the missing value in the job file, on the command line or through the environment (.env)"
            }
            EtlError::ConfigError { .. }
            | EtlError::ConfigValidationError { .. }
            | EtlError::InvalidConfigValueError { .. } => {
                "Fix the job configuration and run again"
            }
            EtlError::ApiError(_) => "Check network connectivity and the configured API URL",
            EtlError::SerializationError(_) => "Check the run log and cache file locations",
            EtlError::ProcessingError { .. } => "Re-run with --verbose for details",
        }
    }

    pub fn user_friendly_message(&self) -> String {
        match self.category() {
            ErrorCategory::Configuration => format!("Invalid configuration: {}", self),
            ErrorCategory::Input => format!("Cannot process input: {}", self),
            ErrorCategory::Output => format!("Cannot write results: {}", self),
            ErrorCategory::Network => format!("Cannot reach the LLM API: {}", self),
            ErrorCategory::Processing => format!("Processing failed: {}", self),
        }
    }
}

/// Row failed to render a prompt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("field '{field}' is not present in the row")]
    MissingField { field: String },

    #[error("field '{field}' is empty")]
    EmptyField { field: String },
}

/// Classified failure from the LLM client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GenerationError {
    #[error("request timed out")]
    Timeout,

    #[error("rate limited by the API")]
    RateLimited { retry_after: Option<Duration> },

    #[error("server error (status {status:?}): {message}")]
    ServerError { status: Option<u16>, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl GenerationError {
    /// Only timeouts and rate limiting are worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GenerationError::Timeout | GenerationError::RateLimited { .. }
        )
    }

    pub fn reason_code(&self) -> &'static str {
        match self {
            GenerationError::Timeout => "timeout",
            GenerationError::RateLimited { .. } => "rate_limited",
            GenerationError::ServerError { .. } => "server_error",
            GenerationError::InvalidResponse(_) => "invalid_response",
        }
    }
}

/// Generated text does not follow the expected output grammar.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("response is empty")]
    EmptyResponse,

    #[error("unexpected text before the first field marker: '{excerpt}'")]
    UnexpectedPreamble { excerpt: String },

    #[error("field '{field}' is missing")]
    MissingField { field: String },

    #[error("field '{field}' appears more than once")]
    DuplicateField { field: String },

    #[error("field '{field}' appears before '{expected}'")]
    OutOfOrder { field: String, expected: String },

    #[error("field '{field}' has an empty value")]
    EmptyValue { field: String },

    #[error("field '{field}' is not a scalar value")]
    NonScalarValue { field: String },

    #[error("no JSON object found: {0}")]
    InvalidJson(String),
}

/// Processing stage a row failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RowStage {
    Prompt,
    Generate,
    Parse,
}

/// Non-fatal failure of a single row. The row is dropped and logged.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RowError {
    #[error("template error: {0}")]
    Template(#[from] TemplateError),

    #[error("generation error: {0}")]
    Generation(#[from] GenerationError),

    #[error("parse error: {0}")]
    Parse(#[from] ParseError),
}

impl RowError {
    pub fn stage(&self) -> RowStage {
        match self {
            RowError::Template(_) => RowStage::Prompt,
            RowError::Generation(_) => RowStage::Generate,
            RowError::Parse(_) => RowStage::Parse,
        }
    }

    pub fn reason_code(&self) -> &'static str {
        match self {
            RowError::Template(_) => "template_error",
            RowError::Generation(e) => e.reason_code(),
            RowError::Parse(_) => "parse_error",
        }
    }
}
