use crate::domain::model::RowRecord;
use crate::utils::error::{EtlError, Result, TemplateError};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field(String),
}

/// A prompt template with `{column}` placeholders. `{{` and `}}` are literal braces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    segments: Vec<Segment>,
}

impl PromptTemplate {
    pub fn compile(source: &str) -> Result<Self> {
        let invalid = |message: String| EtlError::ConfigValidationError {
            field: "prompt.template".to_string(),
            message,
        };

        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = source.char_indices().peekable();

        while let Some((pos, c)) = chars.next() {
            match c {
                '{' if chars.peek().map(|(_, n)| *n) == Some('{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek().map(|(_, n)| *n) == Some('}') => {
                    chars.next();
                    literal.push('}');
                }
                '{' => {
                    let mut name = String::new();
                    let mut closed = false;
                    for (_, n) in chars.by_ref() {
                        match n {
                            '}' => {
                                closed = true;
                                break;
                            }
                            '{' => {
                                return Err(invalid(format!(
                                    "nested '{{' inside placeholder at byte {}",
                                    pos
                                )))
                            }
                            _ => name.push(n),
                        }
                    }
                    if !closed {
                        return Err(invalid(format!("unclosed placeholder at byte {}", pos)));
                    }
                    let name = name.trim();
                    if name.is_empty() {
                        return Err(invalid(format!("empty placeholder at byte {}", pos)));
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Field(name.to_string()));
                }
                '}' => {
                    return Err(invalid(format!(
                        "unmatched '}}' at byte {} (use '}}}}' for a literal brace)",
                        pos
                    )))
                }
                _ => literal.push(c),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self { segments })
    }

    /// Referenced column names, in template order, without repeats.
    pub fn fields(&self) -> Vec<&str> {
        let mut fields: Vec<&str> = Vec::new();
        for segment in &self.segments {
            if let Segment::Field(name) = segment {
                if !fields.contains(&name.as_str()) {
                    fields.push(name);
                }
            }
        }
        fields
    }
}

#[derive(Debug, Clone)]
pub struct PromptBuilder {
    template: PromptTemplate,
    strict_fields: bool,
}

impl PromptBuilder {
    /// With `strict_fields`, a referenced cell that is blank fails the row
    /// instead of producing a prompt with a hole in it.
    pub fn new(template: PromptTemplate, strict_fields: bool) -> Self {
        Self {
            template,
            strict_fields,
        }
    }

    pub fn build(&self, row: &RowRecord) -> std::result::Result<String, TemplateError> {
        let mut prompt = String::new();
        for segment in &self.template.segments {
            match segment {
                Segment::Literal(text) => prompt.push_str(text),
                Segment::Field(name) => {
                    let value = row.get(name).ok_or_else(|| TemplateError::MissingField {
                        field: name.clone(),
                    })?;
                    if self.strict_fields && value.trim().is_empty() {
                        return Err(TemplateError::EmptyField {
                            field: name.clone(),
                        });
                    }
                    prompt.push_str(value);
                }
            }
        }
        Ok(prompt)
    }

    /// Template fields that no input column provides.
    pub fn missing_columns(&self, columns: &[String]) -> Vec<String> {
        self.template
            .fields()
            .into_iter()
            .filter(|f| !columns.iter().any(|c| c == f))
            .map(str::to_string)
            .collect()
    }
}
