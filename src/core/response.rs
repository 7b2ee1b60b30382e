//! Extraction of generated fields from model output.

use crate::domain::model::{OutputFields, ResponseFormat};
use crate::utils::error::{EtlError, ParseError, Result};
use crate::utils::validation::validate_field_names;
use regex::Regex;
use serde_json::Value;

const EXCERPT_LEN: usize = 40;

#[derive(Debug, Clone)]
pub struct ResponseParser {
    fields: Vec<String>,
    format: ResponseFormat,
    marker: Regex,
}

impl ResponseParser {
    pub fn new(fields: Vec<String>, format: ResponseFormat) -> Result<Self> {
        validate_field_names("response.fields", &fields)?;

        // `key_points` 也接受 "Key Points:" 這種寫法
        let alternatives = fields
            .iter()
            .map(|f| regex::escape(f).replace('_', "[ _]"))
            .collect::<Vec<_>>()
            .join("|");
        let marker = Regex::new(&format!(r"(?im)^[ \t]*({})[ \t]*:", alternatives))
            .map_err(|e| EtlError::config(format!("cannot build field marker pattern: {}", e)))?;

        Ok(Self {
            fields,
            format,
            marker,
        })
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn format(&self) -> ResponseFormat {
        self.format
    }

    pub fn parse(&self, text: &str) -> std::result::Result<OutputFields, ParseError> {
        if text.trim().is_empty() {
            return Err(ParseError::EmptyResponse);
        }
        match self.format {
            ResponseFormat::Sections => self.parse_sections(text),
            ResponseFormat::Json => self.parse_json(text),
        }
    }

    fn field_index(&self, marker_name: &str) -> Option<usize> {
        let normalized = marker_name.to_ascii_lowercase().replace(' ', "_");
        self.fields.iter().position(|f| *f == normalized)
    }

    fn parse_sections(&self, text: &str) -> std::result::Result<OutputFields, ParseError> {
        // (field index, marker start, value start)
        let markers: Vec<(usize, usize, usize)> = self
            .marker
            .captures_iter(text)
            .filter_map(|caps| {
                let whole = caps.get(0)?;
                let name = caps.get(1)?;
                let index = self.field_index(name.as_str())?;
                Some((index, whole.start(), whole.end()))
            })
            .collect();

        let Some(&(_, first_start, _)) = markers.first() else {
            return Err(ParseError::MissingField {
                field: self.fields[0].clone(),
            });
        };

        let preamble = text[..first_start].trim();
        if !preamble.is_empty() {
            return Err(ParseError::UnexpectedPreamble {
                excerpt: excerpt(preamble),
            });
        }

        let mut seen = vec![false; self.fields.len()];
        for &(index, _, _) in &markers {
            if std::mem::replace(&mut seen[index], true) {
                return Err(ParseError::DuplicateField {
                    field: self.fields[index].clone(),
                });
            }
        }

        for (position, &(index, _, _)) in markers.iter().enumerate() {
            if index != position {
                let expected = self.fields[position].clone();
                return Err(if seen[position] {
                    ParseError::OutOfOrder {
                        field: self.fields[index].clone(),
                        expected,
                    }
                } else {
                    ParseError::MissingField { field: expected }
                });
            }
        }
        if markers.len() < self.fields.len() {
            return Err(ParseError::MissingField {
                field: self.fields[markers.len()].clone(),
            });
        }

        let mut values = Vec::with_capacity(self.fields.len());
        for (position, &(index, _, value_start)) in markers.iter().enumerate() {
            let value_end = markers
                .get(position + 1)
                .map(|&(_, start, _)| start)
                .unwrap_or(text.len());
            let value = text[value_start..value_end].trim();
            let field = self.fields[index].clone();
            if value.is_empty() {
                return Err(ParseError::EmptyValue { field });
            }
            values.push((field, value.to_string()));
        }

        Ok(OutputFields::new(values))
    }

    fn parse_json(&self, text: &str) -> std::result::Result<OutputFields, ParseError> {
        let object = match extract_json_object(text)? {
            Value::Object(map) => map,
            other => {
                return Err(ParseError::InvalidJson(format!(
                    "expected an object, found {}",
                    json_kind(&other)
                )))
            }
        };

        let mut values = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            let value = object.get(field).or_else(|| {
                object
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(field))
                    .map(|(_, v)| v)
            });

            let text = match value {
                None | Some(Value::Null) => {
                    return Err(ParseError::MissingField {
                        field: field.clone(),
                    })
                }
                Some(Value::String(s)) => s.trim().to_string(),
                Some(Value::Number(n)) => n.to_string(),
                Some(Value::Bool(b)) => b.to_string(),
                Some(Value::Array(_)) | Some(Value::Object(_)) => {
                    return Err(ParseError::NonScalarValue {
                        field: field.clone(),
                    })
                }
            };
            if text.is_empty() {
                return Err(ParseError::EmptyValue {
                    field: field.clone(),
                });
            }
            values.push((field.clone(), text));
        }

        Ok(OutputFields::new(values))
    }
}

/// Accepts bare JSON, JSON inside a Markdown code fence, or an object
/// surrounded by prose.
fn extract_json_object(text: &str) -> std::result::Result<Value, ParseError> {
    let trimmed = strip_code_fence(text.trim());
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Ok(value);
    }

    match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if start < end => {
            serde_json::from_str::<Value>(&trimmed[start..=end])
                .map_err(|e| ParseError::InvalidJson(e.to_string()))
        }
        _ => Err(ParseError::InvalidJson(format!(
            "no object in '{}'",
            excerpt(trimmed)
        ))),
    }
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // 跳過語言標記，例如 ```json
    let body = rest.split_once('\n').map(|(_, b)| b).unwrap_or(rest);
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn excerpt(text: &str) -> String {
    let mut out: String = text.chars().take(EXCERPT_LEN).collect();
    if text.chars().count() > EXCERPT_LEN {
        out.push('…');
    }
    out
}
