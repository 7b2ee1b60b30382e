//! OpenRouter chat completions client.
//!
//! Sends one user message per prompt and classifies every failure into a
//! [`GenerationError`] so the pipeline can decide between retrying and
//! dropping the row.

use crate::core::retry::RequestPacer;
use crate::domain::model::{Generation, GenerationOptions, TokenUsage};
use crate::domain::ports::LlmClient;
use crate::utils::error::{GenerationError, Result};
use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub const DEFAULT_API_URL: &str = "https://openrouter.ai/api/v1/chat/completions";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

const ERROR_EXCERPT_LEN: usize = 200;

pub struct OpenRouterClient {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    site_url: Option<String>,
    site_name: Option<String>,
    pacer: Option<Mutex<RequestPacer>>,
}

impl OpenRouterClient {
    pub fn new(api_url: impl Into<String>, api_key: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("llm-csv-etl/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            api_url: api_url.into(),
            api_key: api_key.into(),
            site_url: None,
            site_name: None,
            pacer: None,
        })
    }

    /// Sets the `HTTP-Referer` / `X-Title` headers OpenRouter uses for app attribution.
    pub fn with_attribution(mut self, site_url: Option<String>, site_name: Option<String>) -> Self {
        self.site_url = site_url;
        self.site_name = site_name;
        self
    }

    /// Minimum spacing between requests. Zero disables pacing.
    pub fn with_request_interval(mut self, interval: Duration) -> Self {
        self.pacer = (!interval.is_zero()).then(|| Mutex::new(RequestPacer::new(interval)));
        self
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    fn request_body<'a>(prompt: &'a str, options: &'a GenerationOptions) -> ChatRequest<'a> {
        ChatRequest {
            model: &options.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            response_format: options.json_mode.then_some(ResponseFormatSpec {
                format_type: "json_object",
            }),
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormatSpec>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormatSpec {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<TokenUsage>,
    error: Option<ApiErrorBody>,
}

#[derive(Deserialize)]
struct Choice {
    message: MessageContent,
}

#[derive(Deserialize)]
struct MessageContent {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: String,
    code: Option<serde_json::Value>,
}

impl ApiErrorBody {
    fn into_error(self) -> GenerationError {
        // code 可能是數字或字串
        let code = self.code.as_ref().and_then(|c| match c {
            serde_json::Value::Number(n) => n.as_u64(),
            serde_json::Value::String(s) => s.parse().ok(),
            _ => None,
        });
        match code {
            Some(429) => GenerationError::RateLimited { retry_after: None },
            Some(408) => GenerationError::Timeout,
            other => GenerationError::ServerError {
                status: other.and_then(|c| u16::try_from(c).ok()),
                message: excerpt(&self.message),
            },
        }
    }
}

fn transport_error(err: reqwest::Error) -> GenerationError {
    if err.is_timeout() {
        GenerationError::Timeout
    } else {
        GenerationError::ServerError {
            status: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
        }
    }
}

fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<f64>()
        .ok()
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
}

fn excerpt(text: &str) -> String {
    text.chars().take(ERROR_EXCERPT_LEN).collect()
}

#[async_trait]
impl LlmClient for OpenRouterClient {
    async fn generate(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> std::result::Result<Generation, GenerationError> {
        if let Some(pacer) = &self.pacer {
            pacer.lock().await.wait().await;
        }

        debug!(
            model = %options.model,
            prompt_len = prompt.len(),
            json_mode = options.json_mode,
            "sending chat completion request"
        );

        let mut request = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&Self::request_body(prompt, options));
        if let Some(site_url) = &self.site_url {
            request = request.header("HTTP-Referer", site_url);
        }
        if let Some(site_name) = &self.site_name {
            request = request.header("X-Title", site_name);
        }

        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = retry_after(response.headers());
            warn!(status = %status, ?retry_after, "LLM API rate limited");
            return Err(GenerationError::RateLimited { retry_after });
        }
        if status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::GATEWAY_TIMEOUT {
            warn!(status = %status, "LLM API timed out");
            return Err(GenerationError::Timeout);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, body = %excerpt(&body), "LLM API returned error");
            return Err(GenerationError::ServerError {
                status: Some(status.as_u16()),
                message: excerpt(&body),
            });
        }

        let body = response.text().await.map_err(transport_error)?;
        let parsed: ChatResponse = serde_json::from_str(&body).map_err(|e| {
            GenerationError::InvalidResponse(format!("unreadable response body: {}", e))
        })?;

        if let Some(error) = parsed.error {
            warn!(message = %error.message, "LLM API reported an error in a success response");
            return Err(error.into_error());
        }

        let content = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| GenerationError::InvalidResponse("no choices returned".to_string()))?
            .message
            .content
            .unwrap_or_default();
        if content.trim().is_empty() {
            return Err(GenerationError::InvalidResponse(
                "empty message content".to_string(),
            ));
        }

        debug!(
            response_len = content.len(),
            prompt_tokens = parsed.usage.map(|u| u.prompt_tokens),
            completion_tokens = parsed.usage.map(|u| u.completion_tokens),
            "received completion"
        );

        Ok(Generation {
            text: content,
            usage: parsed.usage,
            cached: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(json_mode: bool) -> GenerationOptions {
        GenerationOptions {
            model: "google/gemini-2.5-flash".to_string(),
            temperature: 0.7,
            max_tokens: 512,
            json_mode,
        }
    }

    #[test]
    fn test_request_body_shape() {
        let opts = options(false);
        let body = serde_json::to_value(OpenRouterClient::request_body("hi", &opts)).unwrap();

        assert_eq!(body["model"], "google/gemini-2.5-flash");
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"], "hi");
        assert_eq!(body["max_tokens"], 512);
        assert!(body.get("response_format").is_none());
    }

    #[test]
    fn test_request_body_json_mode() {
        let opts = options(true);
        let body = serde_json::to_value(OpenRouterClient::request_body("hi", &opts)).unwrap();

        assert_eq!(body["response_format"]["type"], "json_object");
    }

    #[test]
    fn test_error_body_classification() {
        let limited = ApiErrorBody {
            message: "slow down".to_string(),
            code: Some(serde_json::json!(429)),
        };
        assert_eq!(
            limited.into_error(),
            GenerationError::RateLimited { retry_after: None }
        );

        let upstream = ApiErrorBody {
            message: "provider down".to_string(),
            code: Some(serde_json::json!("502")),
        };
        assert_eq!(
            upstream.into_error(),
            GenerationError::ServerError {
                status: Some(502),
                message: "provider down".to_string()
            }
        );
    }

    #[test]
    fn test_retry_after_parsing() {
        let mut headers = reqwest::header::HeaderMap::new();
        assert_eq!(retry_after(&headers), None);

        headers.insert(RETRY_AFTER, "3".parse().unwrap());
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(3)));

        headers.insert(RETRY_AFTER, "Wed, 21 Oct 2015 07:28:00 GMT".parse().unwrap());
        assert_eq!(retry_after(&headers), None);

        headers.insert(RETRY_AFTER, "0.5".parse().unwrap());
        assert_eq!(retry_after(&headers), Some(Duration::from_millis(500)));

        // 超出 Duration 範圍、負數、NaN 都視為沒有提示
        for bogus in ["1e20", "-3", "NaN", "inf"] {
            headers.insert(RETRY_AFTER, bogus.parse().unwrap());
            assert_eq!(retry_after(&headers), None, "{}", bogus);
        }
    }

    #[test]
    fn test_zero_interval_disables_pacing() {
        let client = OpenRouterClient::new(DEFAULT_API_URL, "key", DEFAULT_TIMEOUT)
            .unwrap()
            .with_request_interval(Duration::ZERO);
        assert!(client.pacer.is_none());

        let paced = client.with_request_interval(Duration::from_millis(500));
        assert!(paced.pacer.is_some());
    }
}
