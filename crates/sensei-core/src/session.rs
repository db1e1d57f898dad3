//! Provider-side conversation context.

use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

use futures::{Stream, StreamExt};
use tracing::debug;

use crate::error::Error;
use crate::message::{ChatMessage, StreamChunk};
use crate::provider::{CompletionRequest, Provider};

/// Lazy, single-pass sequence of reply text fragments.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String, Error>> + Send>>;

pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_TEMPERATURE: f32 = 0.7;

/// Configuration bag a session is created with.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub model: String,
    pub system_instruction: String,
    pub temperature: f32,
    pub max_output_tokens: Option<u32>,
}

impl SessionConfig {
    pub fn new(system_instruction: impl Into<String>) -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            system_instruction: system_instruction.into(),
            temperature: DEFAULT_TEMPERATURE,
            max_output_tokens: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_output_tokens(mut self, max_output_tokens: Option<u32>) -> Self {
        self.max_output_tokens = max_output_tokens;
        self
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.model.trim().is_empty() {
            return Err(Error::config("model identifier is empty"));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(Error::config(format!(
                "temperature {} is outside 0.0-2.0",
                self.temperature
            )));
        }
        if self.max_output_tokens == Some(0) {
            return Err(Error::config("max_output_tokens must be positive"));
        }
        Ok(())
    }
}

/// One continuous conversation with the provider. History only records
/// completed exchanges; a failed request leaves it unchanged.
pub struct ChatSession {
    provider: Arc<dyn Provider>,
    config: SessionConfig,
    history: Mutex<Vec<ChatMessage>>,
}

impl ChatSession {
    pub fn create(provider: Arc<dyn Provider>, config: SessionConfig) -> Result<Self, Error> {
        config.validate()?;
        debug!(
            provider = provider.name(),
            model = %config.model,
            temperature = config.temperature,
            "Chat session created"
        );
        Ok(Self {
            provider,
            config,
            history: Mutex::new(Vec::new()),
        })
    }

    pub fn history(&self) -> Vec<ChatMessage> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn build_request(&self, text: &str) -> CompletionRequest {
        let mut messages = self.history();
        messages.push(ChatMessage::user(text));

        let mut request = CompletionRequest::new(messages)
            .with_system_instruction(self.config.system_instruction.clone())
            .with_model(self.config.model.clone())
            .with_temperature(self.config.temperature);
        if let Some(max_tokens) = self.config.max_output_tokens {
            request = request.with_max_tokens(max_tokens);
        }
        request
    }

    /// Send `text` on top of the current history and stream the reply.
    pub async fn send_message_stream(&self, text: &str) -> Result<FragmentStream, Error> {
        let request = self.build_request(text);
        debug!(
            history_len = request.messages.len() - 1,
            text_len = text.len(),
            "Sending message"
        );

        let chunks = self.provider.stream(request).await?;
        let fragments = chunks.filter_map(|chunk| async move {
            match chunk {
                Ok(StreamChunk::Delta { content }) if !content.is_empty() => Some(Ok(content)),
                Ok(StreamChunk::Error { message }) => Some(Err(Error::stream(message))),
                Ok(_) => None,
                Err(e) => Some(Err(e)),
            }
        });
        Ok(Box::pin(fragments) as FragmentStream)
    }

    /// Record a completed exchange.
    pub fn commit_turn(&self, user_text: &str, reply: &str) {
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        history.push(ChatMessage::user(user_text));
        history.push(ChatMessage::model(reply));
    }
}
