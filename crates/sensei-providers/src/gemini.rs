use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::{Client, Url};
use reqwest_eventsource::{Event, EventSource};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, trace};

use sensei_core::{ChatMessage, CompletionRequest, Error, Provider, StreamChunk, StreamResult, Usage};

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const FALLBACK_MODEL: &str = "gemini-2.5-flash";
const API_KEY_HEADER: &str = "x-goog-api-key";

pub struct GeminiProvider {
    client: Client,
    api_key: String,
    base_url: String,
}

impl GeminiProvider {
    /// Build a provider, checking the key and endpoint up front.
    pub fn connect(api_key: &str, base_url: Option<&str>) -> Result<Self, Error> {
        if api_key.trim().is_empty() {
            return Err(Error::auth("API key is empty"));
        }
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::config(format!("Failed to build HTTP client: {e}")))?;

        let mut provider = Self {
            client,
            api_key: api_key.trim().to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
        };
        if let Some(base_url) = base_url {
            Url::parse(base_url)
                .map_err(|e| Error::config(format!("Invalid base URL '{base_url}': {e}")))?;
            provider = provider.with_base_url(base_url);
        }
        Ok(provider)
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn resolve_model(&self, request: &CompletionRequest) -> String {
        request
            .model
            .clone()
            .unwrap_or_else(|| FALLBACK_MODEL.to_string())
    }

    fn build_request(&self, request: &CompletionRequest) -> GeminiRequest {
        let contents = request
            .messages
            .iter()
            .filter(|msg| !msg.content.is_empty())
            .map(to_content)
            .collect();

        let system_instruction = request
            .system_instruction
            .as_ref()
            .filter(|text| !text.is_empty())
            .map(|text| GeminiContent {
                role: None, // system_instruction has no role
                parts: vec![GeminiPart {
                    text: text.clone(),
                }],
            });

        GeminiRequest {
            contents: merge_adjacent_contents(contents),
            system_instruction,
            generation_config: Some(GeminiGenerationConfig {
                temperature: request.temperature,
                max_output_tokens: request.max_tokens,
            }),
        }
    }

    fn post(&self, url: &str, body: &GeminiRequest) -> reqwest::RequestBuilder {
        self.client
            .post(url)
            .header("Content-Type", "application/json")
            .header(API_KEY_HEADER, &self.api_key)
            .json(body)
    }

}

fn to_content(msg: &ChatMessage) -> GeminiContent {
    GeminiContent {
        role: Some(msg.role.to_string()),
        parts: vec![GeminiPart {
            text: msg.content.clone(),
        }],
    }
}

/// Gemini rejects consecutive turns with the same role.
fn merge_adjacent_contents(contents: Vec<GeminiContent>) -> Vec<GeminiContent> {
    let mut merged: Vec<GeminiContent> = Vec::new();

    for content in contents {
        if let Some(last) = merged.last_mut() {
            if last.role == content.role {
                last.parts.extend(content.parts);
                continue;
            }
        }
        merged.push(content);
    }

    merged
}

fn blocked_error(feedback: Option<&GeminiPromptFeedback>) -> Error {
    match feedback.and_then(|f| f.block_reason.as_deref()) {
        Some(reason) => Error::api(400, format!("Blocked by safety filter: {reason}")),
        None => Error::api(500, "No candidates in Gemini response"),
    }
}

fn parse_error(status: u16, body: &str) -> Error {
    #[derive(Deserialize)]
    struct ErrorResponse {
        error: ErrorDetail,
    }

    #[derive(Deserialize)]
    struct ErrorDetail {
        message: String,
    }

    let message = serde_json::from_str::<ErrorResponse>(body)
        .map(|err| err.error.message)
        .unwrap_or_else(|_| body.to_string());

    match status {
        401 | 403 => Error::auth(message),
        429 => Error::rate_limit(message),
        400 if message.contains("API key") => Error::auth(message),
        400 => Error::invalid_request(message),
        _ => Error::api(status, message),
    }
}

/// Turn one SSE payload into the chunks it carries.
fn parse_stream_event(data: &str) -> Result<Vec<StreamChunk>, Error> {
    let response: GeminiResponse = serde_json::from_str(data)
        .map_err(|e| Error::stream(format!("Failed to parse Gemini SSE: {e}")))?;
    let usage = response.usage();

    let Some(candidates) = response.candidates else {
        if response.prompt_feedback.is_some() {
            return Err(blocked_error(response.prompt_feedback.as_ref()));
        }
        return Ok(Vec::new());
    };

    let mut chunks = Vec::new();
    for candidate in candidates {
        if let Some(content) = candidate.content {
            chunks.extend(
                content
                    .parts
                    .into_iter()
                    .filter(|p| !p.text.is_empty())
                    .map(|p| StreamChunk::Delta { content: p.text }),
            );
        }
        if let Some(reason) = candidate.finish_reason {
            debug!(finish_reason = %reason, "Gemini stream complete");
            chunks.push(StreamChunk::Done {
                usage: usage.clone(),
            });
        }
    }
    Ok(chunks)
}

#[async_trait]
impl Provider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn stream(&self, request: CompletionRequest) -> Result<StreamResult, Error> {
        let model = self.resolve_model(&request);
        let api_request = self.build_request(&request);

        debug!(
            model = %model,
            content_count = api_request.contents.len(),
            "Gemini stream request"
        );
        trace!(request = %serde_json::to_string(&api_request).unwrap_or_default(), "Gemini stream request payload");

        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            self.base_url, model
        );
        let es = EventSource::new(self.post(&url, &api_request))
            .map_err(|e| Error::stream(e.to_string()))?;

        let (tx, rx) = mpsc::channel::<Result<StreamChunk, Error>>(100);

        tokio::spawn(async move {
            let mut es = es;
            forward_events(&mut es, &tx).await;
            es.close();
        });

        let stream = ReceiverStream::new(rx);
        Ok(Box::pin(stream) as StreamResult)
    }
}

/// Relay SSE events into `tx` until the stream ends, fails, or the receiver
/// is dropped.
async fn forward_events<S>(events: &mut S, tx: &mpsc::Sender<Result<StreamChunk, Error>>)
where
    S: Stream<Item = Result<Event, reqwest_eventsource::Error>> + Unpin,
{
    while let Some(event) = events.next().await {
        match event {
            Ok(Event::Open) => {
                debug!("Gemini SSE connection opened");
            }
            Ok(Event::Message(msg)) => {
                trace!(data = %msg.data, "Gemini SSE chunk");
                match parse_stream_event(&msg.data) {
                    Ok(chunks) => {
                        for chunk in chunks {
                            if tx.send(Ok(chunk)).await.is_err() {
                                debug!("Gemini stream consumer dropped");
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        error!(error = %e, data = %msg.data, "Bad Gemini SSE chunk");
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                }
            }
            Err(reqwest_eventsource::Error::StreamEnded) => {
                debug!("Gemini SSE stream ended");
                return;
            }
            Err(reqwest_eventsource::Error::InvalidStatusCode(status, response)) => {
                let body = response.text().await.unwrap_or_default();
                error!(status = status.as_u16(), body = %body, "Gemini stream request failed");
                let _ = tx.send(Err(parse_error(status.as_u16(), &body))).await;
                return;
            }
            Err(reqwest_eventsource::Error::Transport(e)) => {
                error!(error = %e, "Gemini SSE transport error");
                let _ = tx.send(Err(Error::network(e.to_string()))).await;
                return;
            }
            Err(e) => {
                error!(error = ?e, "Gemini SSE error");
                let _ = tx
                    .send(Err(Error::stream(format!("Gemini SSE error: {e}"))))
                    .await;
                return;
            }
        }
    }
}

// ── Gemini API types ─────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GeminiGenerationConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
}

// ── Response types ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Option<Vec<GeminiCandidate>>,
    #[serde(default)]
    usage_metadata: Option<GeminiUsageMetadata>,
    #[serde(default)]
    prompt_feedback: Option<GeminiPromptFeedback>,
}

impl GeminiResponse {
    fn usage(&self) -> Option<Usage> {
        self.usage_metadata.as_ref().map(|u| {
            Usage::new(
                u.prompt_token_count.unwrap_or(0),
                u.candidates_token_count.unwrap_or(0),
            )
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsageMetadata {
    #[serde(default)]
    prompt_token_count: Option<u32>,
    #[serde(default)]
    candidates_token_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

// ── Tests ────────────────────────────────────────────────────────────────────
