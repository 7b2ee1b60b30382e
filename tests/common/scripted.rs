use async_trait::async_trait;
use llm_csv_etl::domain::model::{Generation, GenerationOptions};
use llm_csv_etl::domain::ports::LlmClient;
use llm_csv_etl::utils::error::GenerationError;
use std::collections::VecDeque;
use std::sync::Mutex;

type Reply = Result<Generation, GenerationError>;

/// Hands out queued replies in order and remembers every prompt.
/// An empty queue answers `InvalidResponse`.
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
        self.replies.lock().unwrap().push_back(reply);
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn generate(&self, prompt: &str, _options: &GenerationOptions) -> Reply {
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.replies.lock().unwrap().pop_front().unwrap_or_else(|| {
            Err(GenerationError::InvalidResponse(
                "no scripted reply left".to_string(),
            ))
        })
    }
}
