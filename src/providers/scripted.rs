use std::{collections::VecDeque, sync::Mutex};

use async_stream::stream;
use async_trait::async_trait;

use crate::{
    providers::LLMProvider,
    types::{CompletionRequest, CompletionResponse, CompletionStream, StreamEvent},
    LLMError,
};

/// A canned reply: streamed tokens, an API failure before any token, or a
/// stream that breaks after some tokens.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Tokens(Vec<String>),
    Failure { status: u16, message: String },
    Interrupted { tokens: Vec<String>, message: String },
}

impl ScriptedReply {
    pub fn tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Tokens(tokens.into_iter().map(Into::into).collect())
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::Tokens(vec![text.into()])
    }

    pub fn failure(status: u16, message: impl Into<String>) -> Self {
        Self::Failure {
            status,
            message: message.into(),
        }
    }

    pub fn interrupted<I, S>(tokens: I, message: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Interrupted {
            tokens: tokens.into_iter().map(Into::into).collect(),
            message: message.into(),
        }
    }
}

/// Replays scripted replies in order and records every request it receives.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    replies: Mutex<VecDeque<ScriptedReply>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedProvider {
    pub fn new<I>(replies: I) -> Self
    where
        I: IntoIterator<Item = ScriptedReply>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Requests seen so far, in call order.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        match self.requests.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn lock_replies(&self) -> std::sync::MutexGuard<'_, VecDeque<ScriptedReply>> {
        match self.replies.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Returns the tokens to stream and the error that ends the stream early, if any.
    fn next_reply(
        &self,
        request: CompletionRequest,
    ) -> Result<(Vec<String>, Option<String>), LLMError> {
        match self.requests.lock() {
            Ok(mut guard) => guard.push(request),
            Err(poisoned) => poisoned.into_inner().push(request),
        }

        match self.lock_replies().pop_front() {
            Some(ScriptedReply::Tokens(tokens)) => Ok((tokens, None)),
            Some(ScriptedReply::Interrupted { tokens, message }) => Ok((tokens, Some(message))),
            Some(ScriptedReply::Failure { status, message }) => {
                Err(LLMError::Api { status, message })
            }
            None => Err(LLMError::Provider("no more scripted responses".to_string())),
        }
    }
}

#[async_trait]
impl LLMProvider for ScriptedProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
        let (tokens, interruption) = self.next_reply(request)?;
        if let Some(message) = interruption {
            return Err(LLMError::Provider(message));
        }
        Ok(CompletionResponse {
            content: tokens.concat(),
            usage: None,
        })
    }

    async fn stream_completion(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionStream, LLMError> {
        let (tokens, interruption) = self.next_reply(request)?;

        let stream = stream! {
            let mut message = String::new();
            for token in tokens {
                if token.is_empty() {
                    continue;
                }
                message.push_str(&token);
                yield Ok::<_, LLMError>(StreamEvent::MessageDelta(token));
            }

            if let Some(error) = interruption {
                yield Err(LLMError::Provider(error));
                return;
            }

            yield Ok(StreamEvent::Completed(CompletionResponse {
                content: message,
                usage: None,
            }));
        };

        Ok(Box::pin(stream))
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}
