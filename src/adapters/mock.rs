//! Scripted [`LlmClient`] for unit tests.

use crate::domain::model::{Generation, GenerationOptions};
use crate::domain::ports::LlmClient;
use crate::utils::error::GenerationError;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

type Reply = std::result::Result<Generation, GenerationError>;

/// Returns queued replies in order and records every prompt it receives.
/// When the queue is empty, every call fails with `InvalidResponse`.
#[derive(Default)]
pub struct ScriptedLlmClient {
    replies: Mutex<VecDeque<Reply>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_replies<I>(replies: I) -> Self
    where
        I: IntoIterator<Item = Reply>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            prompts: Mutex::default(),
        }
    }

    pub fn push_text(&self, text: impl Into<String>) {
        self.push(Ok(Generation::new(text)));
    }

    pub fn push_error(&self, err: GenerationError) {
        self.push(Err(err));
    }

    pub fn push(&self, reply: Reply) {
        self.replies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(reply);
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn generate(&self, prompt: &str, _options: &GenerationOptions) -> Reply {
        self.prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(prompt.to_string());
        self.replies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_else(|| {
                Err(GenerationError::InvalidResponse(
                    "no scripted reply left".to_string(),
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> GenerationOptions {
        GenerationOptions {
            model: "test/model".to_string(),
            temperature: 1.0,
            max_tokens: 64,
            json_mode: false,
        }
    }

    #[test]
    fn test_replies_in_order_then_exhausted() {
        let client = ScriptedLlmClient::new();
        client.push_text("first");
        client.push_error(GenerationError::Timeout);

        let first = tokio_test::block_on(client.generate("a", &options())).unwrap();
        assert_eq!(first.text, "first");
        assert_eq!(
            tokio_test::block_on(client.generate("b", &options())),
            Err(GenerationError::Timeout)
        );
        assert!(matches!(
            tokio_test::block_on(client.generate("c", &options())),
            Err(GenerationError::InvalidResponse(_))
        ));

        assert_eq!(client.prompts(), vec!["a", "b", "c"]);
        assert_eq!(client.calls(), 3);
    }
}
