use async_trait::async_trait;

use crate::types::{CompletionRequest, CompletionResponse, CompletionStream};
use crate::LLMError;

pub mod openai;
pub mod scripted;

/// One chat-completion round trip against a model service.
#[async_trait]
pub trait LLMProvider: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError>;

    /// Streams [`StreamEvent::MessageDelta`](crate::StreamEvent) items followed by a single
    /// [`StreamEvent::Completed`](crate::StreamEvent) carrying the full text.
    async fn stream_completion(
        &self,
        _request: CompletionRequest,
    ) -> Result<CompletionStream, LLMError> {
        Err(LLMError::Unsupported("streaming completions"))
    }

    /// Checks that the configured credential is accepted by the service.
    /// Providers that cannot check report `false`.
    async fn probe(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str;
}
