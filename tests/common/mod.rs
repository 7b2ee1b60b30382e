#![allow(dead_code)]

mod scripted;

pub use scripted::ScriptedLlmClient;

use llm_csv_etl::JobConfig;
use std::path::{Path, PathBuf};

pub const STORY_SECTIONS: &str = r#"
[prompt]
template = "Write a story about {topic} for {audience}."

[response]
fields = ["title", "body"]
"#;

/// TOML paths use forward slashes so Windows temp dirs survive the string escape.
pub fn toml_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

pub fn input_path(dir: &Path) -> PathBuf {
    dir.join("input.csv")
}

pub fn output_path(dir: &Path) -> PathBuf {
    dir.join("output").join("output.csv")
}

/// Writes `input_csv` into `dir` and builds a job around it. `sections` carries
/// the `[prompt]`, `[response]` and any other tables the test needs.
pub fn job_with_input(dir: &Path, input_csv: &str, sections: &str) -> JobConfig {
    std::fs::write(input_path(dir), input_csv).expect("write input");
    let content = format!(
        r#"
[input]
path = "{}"

[output]
path = "{}"

[retry]
max_attempts = 3
base_delay_ms = 1
max_delay_ms = 5

{}
"#,
        toml_path(&input_path(dir)),
        toml_path(&output_path(dir)),
        sections
    );
    JobConfig::from_toml_str(&content).expect("valid job")
}

pub fn read_output(dir: &Path) -> Vec<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_path(output_path(dir))
        .expect("output exists");
    reader
        .records()
        .map(|r| r.expect("valid row").iter().map(str::to_string).collect())
        .collect()
}

pub fn read_run_log(path: &Path) -> Vec<serde_json::Value> {
    std::fs::read_to_string(path)
        .expect("run log exists")
        .lines()
        .map(|l| serde_json::from_str(l).expect("json line"))
        .collect()
}
