use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{
    error::LLMError,
    providers::LLMProvider,
    types::{
        ChatMessage, CompletionRequest, CompletionResponse, CompletionStream, StreamEvent,
        TokenUsage,
    },
};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Model id fragments of the families that reject `max_tokens` and expect
/// `max_completion_tokens` instead.
const COMPLETION_TOKENS_FAMILIES: &[&str] = &["gpt-5", "o1", "o3", "o4"];

const GENERIC_API_FAILURE: &str = "API request failed";

const ORGANIZATION_HEADER: &str = "OpenAI-Organization";
const PROJECT_HEADER: &str = "OpenAI-Project";

/// Connection settings. Organization and project are sent as scoping headers
/// on every request when set.
#[derive(Debug, Clone)]
pub struct OpenAIConfig {
    pub api_key: String,
    pub base_url: String,
    pub organization: Option<String>,
    pub project: Option<String>,
    pub request_timeout: Duration,
}

impl OpenAIConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            organization: None,
            project: None,
            request_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_organization(mut self, organization: impl Into<String>) -> Self {
        self.organization = Some(organization.into());
        self
    }

    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    pub fn with_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }
}

#[derive(Debug, Clone)]
pub struct OpenAI {
    client: Client,
    config: OpenAIConfig,
}

impl OpenAI {
    pub fn new(api_key: impl Into<String>) -> Result<Self, LLMError> {
        Self::from_config(OpenAIConfig::new(api_key))
    }

    pub fn from_config(config: OpenAIConfig) -> Result<Self, LLMError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self { client, config })
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        let scopes = [
            (ORGANIZATION_HEADER, &self.config.organization),
            (PROJECT_HEADER, &self.config.project),
        ];

        scopes
            .into_iter()
            .filter_map(|(name, value)| value.as_deref().map(|value| (name, value)))
            .fold(builder.bearer_auth(&self.config.api_key), |builder, (name, value)| {
                builder.header(name, value)
            })
    }

    async fn send_chat(
        &self,
        body: &OpenAIRequestBody,
        stream: bool,
    ) -> Result<Response, LLMError> {
        let mut builder = self
            .authorized(self.client.post(self.endpoint("chat/completions")))
            .json(body);

        if stream {
            builder = builder
                .header("Accept", "text/event-stream")
                .header("Cache-Control", "no-cache");
        }

        let response = builder.send().await?;
        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        Ok(response)
    }
}

pub(crate) fn uses_completion_tokens_field(model: &str) -> bool {
    COMPLETION_TOKENS_FAMILIES
        .iter()
        .any(|family| model.contains(family))
}

#[derive(Debug, Serialize)]
struct OpenAIRequestBody {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_completion_tokens: Option<u32>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
}

impl OpenAIRequestBody {
    fn from_request(request: CompletionRequest, stream: bool) -> Self {
        let CompletionRequest {
            model,
            messages,
            temperature,
            max_tokens,
            json_mode,
        } = request;

        let (max_tokens, max_completion_tokens) = if uses_completion_tokens_field(&model) {
            (None, Some(max_tokens))
        } else {
            (Some(max_tokens), None)
        };

        Self {
            model,
            messages,
            temperature,
            max_tokens,
            max_completion_tokens,
            stream,
            response_format: json_mode.then(|| json!({ "type": "json_object" })),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ResponseChoice>,
    #[serde(default)]
    usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
struct ResponseChoice {
    #[serde(default)]
    message: Option<ResponseMessage>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChatCompletionChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunkChoice {
    #[serde(default)]
    delta: Option<ChunkDelta>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIErrorEnvelope {
    #[serde(default)]
    error: Option<OpenAIError>,
}

#[derive(Debug, Deserialize)]
struct OpenAIError {
    #[serde(default)]
    message: Option<String>,
}

async fn api_error(response: Response) -> LLMError {
    let status = response.status().as_u16();
    let text = response.text().await.unwrap_or_default();

    let message = serde_json::from_str::<OpenAIErrorEnvelope>(&text)
        .ok()
        .and_then(|envelope| envelope.error)
        .and_then(|error| error.message)
        .filter(|message| !message.is_empty())
        .unwrap_or_else(|| GENERIC_API_FAILURE.to_string());

    LLMError::Api { status, message }
}

#[async_trait]
impl LLMProvider for OpenAI {
    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, LLMError> {
        let body = OpenAIRequestBody::from_request(request, false);
        let response = self.send_chat(&body, false).await?;

        let parsed: ChatCompletionResponse = response.json().await?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message)
            .and_then(|message| message.content)
            .unwrap_or_default();

        Ok(CompletionResponse {
            content,
            usage: parsed.usage,
        })
    }

    async fn stream_completion(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionStream, LLMError> {
        let body = OpenAIRequestBody::from_request(request, true);
        let response = self.send_chat(&body, true).await?;

        let stream = try_stream! {
            let mut decoder = SseLineDecoder::default();
            let mut message = String::new();
            let mut body_stream = response.bytes_stream();
            let mut finished = false;

            while let Some(chunk) = body_stream.next().await {
                let chunk = chunk?;

                for frame in decoder.feed(&chunk) {
                    match frame {
                        SseFrame::Delta(text) => {
                            message.push_str(&text);
                            yield StreamEvent::MessageDelta(text);
                        }
                        SseFrame::Done => {
                            finished = true;
                            break;
                        }
                    }
                }

                if finished {
                    break;
                }
            }

            if !finished {
                if let Some(SseFrame::Delta(text)) = decoder.finish() {
                    message.push_str(&text);
                    yield StreamEvent::MessageDelta(text);
                }
            }

            yield StreamEvent::Completed(CompletionResponse {
                content: message,
                usage: None,
            });
        };

        Ok(Box::pin(stream))
    }

    async fn probe(&self) -> bool {
        let builder = self.authorized(self.client.get(self.endpoint("models")));

        match builder.send().await {
            Ok(response) => response.status().is_success(),
            Err(error) => {
                tracing::debug!(%error, "credential probe failed");
                false
            }
        }
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

#[derive(Debug, Clone, PartialEq)]
enum SseFrame {
    Delta(String),
    Done,
}

/// Line-oriented decoder for `data: <json>` frames. Bytes are buffered until a
/// newline arrives so frames cut across network reads are reassembled.
#[derive(Debug, Default)]
struct SseLineDecoder {
    buffer: Vec<u8>,
}

impl SseLineDecoder {
    fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(frame) = decode_line(&line) {
                frames.push(frame);
            }
        }

        frames
    }

    /// Flushes a trailing line that was not newline-terminated.
    fn finish(&mut self) -> Option<SseFrame> {
        let rest = std::mem::take(&mut self.buffer);
        decode_line(&rest)
    }
}

fn decode_line(line: &[u8]) -> Option<SseFrame> {
    let text = String::from_utf8_lossy(line);
    let text = text.trim_end_matches(['\r', '\n']);
    let payload = text.strip_prefix("data: ")?;

    if payload == "[DONE]" {
        return Some(SseFrame::Done);
    }

    match serde_json::from_str::<ChatCompletionChunk>(payload) {
        Ok(chunk) => chunk
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.delta)
            .and_then(|delta| delta.content)
            .filter(|text| !text.is_empty())
            .map(SseFrame::Delta),
        Err(error) => {
            tracing::trace!(%error, "skipping malformed stream frame");
            None
        }
    }
}
