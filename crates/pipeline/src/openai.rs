//! OpenAI-compatible HTTP provider: embeddings, chat completion, and SSE
//! streaming. Works against OpenAI itself or any server speaking the same
//! wire format (Ollama, vLLM, local proxies).

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use tably_core::config::{EmbeddingConfig, LlmConfig};
use tably_core::domain::query::TokenUsage;
use tably_core::errors::ProviderError;
use tably_core::intent::IntentModel;

use crate::providers::{Completion, EmbeddingProvider, GenerationChunk, GenerationProvider};

const DEFAULT_BASE_URL: &str = "https://api.openai.com";
const STREAM_CHANNEL_CAPACITY: usize = 32;

#[derive(Clone)]
pub struct OpenAiClient {
    http: Client,
    base_url: String,
    api_key: Option<SecretString>,
    chat_model: String,
    embedding_model: String,
}

impl OpenAiClient {
    pub fn from_config(llm: &LlmConfig, embedding: &EmbeddingConfig) -> Result<Self, ProviderError> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(llm.timeout_secs))
            .build()
            .map_err(|error| ProviderError::Transport(error.to_string()))?;

        Ok(Self {
            http,
            base_url: llm
                .base_url
                .clone()
                .or_else(|| embedding.base_url.clone())
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key: llm.api_key.clone().or_else(|| embedding.api_key.clone()),
            chat_model: llm.model.clone(),
            embedding_model: embedding.model.clone(),
        })
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key.expose_secret()),
            None => builder,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn error_from_response(response: reqwest::Response) -> ProviderError {
        let status = response.status();
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(1);
        let body = response.text().await.unwrap_or_default();

        match status {
            StatusCode::TOO_MANY_REQUESTS if body.contains("insufficient_quota") => {
                ProviderError::QuotaExceeded(body)
            }
            StatusCode::TOO_MANY_REQUESTS => {
                ProviderError::RateLimited { retry_after_secs: retry_after }
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                ProviderError::InvalidCredentials(format!("status {status}"))
            }
            _ => ProviderError::Transport(format!("status {status}: {body}")),
        }
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(Deserialize)]
struct EmbeddingRow {
    embedding: Vec<f32>,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Deserialize)]
struct ChatStreamFrame {
    choices: Vec<ChatStreamChoice>,
}

#[derive(Deserialize)]
struct ChatStreamChoice {
    delta: ChatStreamDelta,
}

#[derive(Deserialize)]
struct ChatStreamDelta {
    content: Option<String>,
}

#[async_trait]
impl EmbeddingProvider for OpenAiClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let request = EmbeddingRequest { model: &self.embedding_model, input: text };
        let response = self
            .authorized(self.http.post(self.endpoint("v1/embeddings")))
            .json(&request)
            .send()
            .await
            .map_err(|error| ProviderError::Transport(error.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|error| ProviderError::InvalidResponse(error.to_string()))?;
        parsed
            .data
            .into_iter()
            .next()
            .map(|row| row.embedding)
            .ok_or_else(|| ProviderError::InvalidResponse("empty embedding data".to_string()))
    }
}

#[async_trait]
impl GenerationProvider for OpenAiClient {
    async fn complete(&self, prompt: &str) -> Result<Completion, ProviderError> {
        let request = ChatRequest {
            model: &self.chat_model,
            messages: vec![ChatMessage { role: "user", content: prompt }],
            stream: false,
        };
        let response = self
            .authorized(self.http.post(self.endpoint("v1/chat/completions")))
            .json(&request)
            .send()
            .await
            .map_err(|error| ProviderError::Transport(error.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|error| ProviderError::InvalidResponse(error.to_string()))?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| ProviderError::InvalidResponse("empty chat choices".to_string()))?;
        let usage = parsed
            .usage
            .map(|usage| TokenUsage {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
            })
            .unwrap_or_default();

        Ok(Completion { text, usage })
    }

    async fn stream(
        &self,
        prompt: &str,
    ) -> Result<mpsc::Receiver<Result<GenerationChunk, ProviderError>>, ProviderError> {
        let request = ChatRequest {
            model: &self.chat_model,
            messages: vec![ChatMessage { role: "user", content: prompt }],
            stream: true,
        };
        let mut response = self
            .authorized(self.http.post(self.endpoint("v1/chat/completions")))
            .json(&request)
            .send()
            .await
            .map_err(|error| ProviderError::Transport(error.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }

        let (sender, receiver) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            let mut buffer = String::new();
            loop {
                let chunk = match response.chunk().await {
                    Ok(Some(chunk)) => chunk,
                    Ok(None) => break,
                    Err(error) => {
                        let _ = sender.send(Err(ProviderError::Transport(error.to_string()))).await;
                        return;
                    }
                };

                buffer.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(newline) = buffer.find('\n') {
                    let line = buffer[..newline].trim().to_string();
                    buffer.drain(..=newline);

                    let Some(payload) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    if payload == "[DONE]" {
                        return;
                    }

                    let Ok(frame) = serde_json::from_str::<ChatStreamFrame>(payload) else {
                        continue;
                    };
                    let Some(text) =
                        frame.choices.into_iter().next().and_then(|choice| choice.delta.content)
                    else {
                        continue;
                    };
                    if !text.is_empty()
                        && sender.send(Ok(GenerationChunk { text })).await.is_err()
                    {
                        // Consumer hung up; drop the HTTP response with us.
                        return;
                    }
                }
            }
        });

        Ok(receiver)
    }
}

#[async_trait]
impl IntentModel for OpenAiClient {
    async fn classify_intent(&self, prompt: &str) -> Result<String, ProviderError> {
        self.complete(prompt).await.map(|completion| completion.text)
    }
}
