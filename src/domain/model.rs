use crate::utils::error::{RowError, RowStage};
use crate::utils::stats::UsageStats;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// One data row of the input file. `values` is aligned with `columns`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowRecord {
    pub index: usize,
    columns: Arc<[String]>,
    values: Vec<String>,
}

impl RowRecord {
    pub fn new(index: usize, columns: Arc<[String]>, values: Vec<String>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self {
            index,
            columns,
            values,
        }
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|i| self.values[i].as_str())
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.columns
            .iter()
            .zip(self.values.iter())
            .map(|(c, v)| (c.as_str(), v.as_str()))
    }
}

/// Input file contents in file order.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub columns: Arc<[String]>,
    pub rows: Vec<RowRecord>,
}

impl Dataset {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Fields extracted from a generated response, in configured order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OutputFields(Vec<(String, String)>);

impl OutputFields {
    pub fn new(fields: Vec<(String, String)>) -> Self {
        Self(fields)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_values(self) -> impl Iterator<Item = String> {
        self.0.into_iter().map(|(_, v)| v)
    }
}

/// One output row: input values followed by generated values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputRecord {
    pub index: usize,
    pub values: Vec<String>,
}

impl OutputRecord {
    pub fn from_row(row: &RowRecord, generated: OutputFields) -> Self {
        let mut values = Vec::with_capacity(row.values().len() + generated.len());
        values.extend(row.values().iter().cloned());
        values.extend(generated.into_values());
        Self {
            index: row.index,
            values,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
pub enum ResponseFormat {
    /// `Field: value` marker lines
    #[default]
    Sections,
    /// A JSON object keyed by field name
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationOptions {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub json_mode: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

/// Successful LLM call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    pub text: String,
    pub usage: Option<TokenUsage>,
    /// Served from the response cache, no API call made.
    pub cached: bool,
}

impl Generation {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            usage: None,
            cached: false,
        }
    }
}

/// Per-row lifecycle. `Written` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RowState {
    Pending,
    Prompted,
    Generated,
    Parsed,
    Written,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct FailureCounts {
    pub template: usize,
    pub generation: usize,
    pub parse: usize,
}

impl FailureCounts {
    pub fn record(&mut self, err: &RowError) {
        match err.stage() {
            RowStage::Prompt => self.template += 1,
            RowStage::Generate => self.generation += 1,
            RowStage::Parse => self.parse += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.template + self.generation + self.parse
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub output_path: PathBuf,
    pub total_rows: usize,
    pub processed_rows: usize,
    pub rows_written: usize,
    pub failures: FailureCounts,
    pub aborted: bool,
    pub usage: UsageStats,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn rows_failed(&self) -> usize {
        self.failures.total()
    }
}
