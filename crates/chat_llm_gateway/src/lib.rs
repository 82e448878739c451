//! A [`chat_core::LlmGateway`] implementation over an OpenAI-compatible HTTP API, using
//! `reqwest` for plain requests and `reqwest-eventsource` for streaming chat completions.

use std::pin::Pin;

use futures::{Stream, StreamExt};
use reqwest_eventsource::{Event, EventSource};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use chat_core::llm::{LlmGateway, LlmGatewayError, StreamEvent, StreamHandle};

/// Connection details for an OpenAI-compatible provider.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub api_key: String,
    pub chat_model: String,
    pub embedding_model: String,
}

pub struct HttpLlmGateway {
    client: reqwest::Client,
    config: GatewayConfig,
}

impl HttpLlmGateway {
    pub fn new(config: GatewayConfig) -> Self {
        HttpLlmGateway {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn chat_request_body(&self, prompt: &str, instructions: Option<&str>, stream: bool) -> serde_json::Value {
        let mut messages = Vec::new();
        if let Some(instructions) = instructions {
            messages.push(serde_json::json!({"role": "system", "content": instructions}));
        }
        messages.push(serde_json::json!({"role": "user", "content": prompt}));

        serde_json::json!({
            "model": self.config.chat_model,
            "messages": messages,
            "stream": stream,
            "temperature": if stream { 1.0 } else { 0.0 },
        })
    }
}

#[derive(Deserialize)]
struct ChatCompletionChunk {
    choices: Vec<ChatCompletionChunkChoice>,
}

#[derive(Deserialize)]
struct ChatCompletionChunkChoice {
    delta: ChatCompletionChunkDelta,
}

#[derive(Deserialize, Default)]
struct ChatCompletionChunkDelta {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatCompletionChoice>,
}

#[derive(Deserialize)]
struct ChatCompletionChoice {
    message: ChatCompletionMessage,
}

#[derive(Deserialize)]
struct ChatCompletionMessage {
    content: Option<String>,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
    index: usize,
}

struct HttpStreamHandle {
    token: CancellationToken,
    rx: Option<mpsc::Receiver<StreamEvent>>,
}

impl StreamHandle for HttpStreamHandle {
    fn events(&mut self) -> Pin<Box<dyn Stream<Item = StreamEvent> + Send + '_>> {
        let rx = self
            .rx
            .take()
            .expect("events() called more than once on the same stream handle");
        Box::pin(ReceiverStream::new(rx))
    }

    fn abort(&self) {
        self.token.cancel();
    }

    fn abort_trigger(&self) -> std::sync::Arc<dyn Fn() + Send + Sync> {
        let token = self.token.clone();
        std::sync::Arc::new(move || token.cancel())
    }
}

#[async_trait::async_trait]
impl LlmGateway for HttpLlmGateway {
    async fn stream_response(
        &self,
        prompt: &str,
        instructions: Option<&str>,
    ) -> Result<Box<dyn StreamHandle>, LlmGatewayError> {
        let body = self.chat_request_body(prompt, instructions, true);
        let url = format!("{}/chat/completions", self.config.base_url);

        let request = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&body);

        let mut event_source =
            EventSource::new(request).map_err(|e| LlmGatewayError::Transport(e.to_string()))?;

        let token = CancellationToken::new();
        let worker_token = token.clone();
        let (tx, rx) = mpsc::channel(32);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = worker_token.cancelled() => {
                        event_source.close();
                        let _ = tx.send(StreamEvent::Aborted).await;
                        return;
                    }
                    next = event_source.next() => {
                        match next {
                            None => {
                                let _ = tx.send(StreamEvent::Completed).await;
                                return;
                            }
                            Some(Ok(Event::Open)) => continue,
                            Some(Ok(Event::Message(message))) => {
                                if message.data == "[DONE]" {
                                    let _ = tx.send(StreamEvent::Completed).await;
                                    return;
                                }

                                match serde_json::from_str::<ChatCompletionChunk>(&message.data) {
                                    Ok(chunk) => {
                                        if let Some(choice) = chunk.choices.into_iter().next() {
                                            if let Some(delta) = choice.delta.content {
                                                if !delta.is_empty()
                                                    && tx
                                                        .send(StreamEvent::TextDelta(delta))
                                                        .await
                                                        .is_err()
                                                {
                                                    event_source.close();
                                                    return;
                                                }
                                            }
                                        }
                                    }
                                    Err(e) => {
                                        debug!(error = %e, "malformed chat completion chunk");
                                    }
                                }
                            }
                            Some(Err(reqwest_eventsource::Error::StreamEnded)) => {
                                let _ = tx.send(StreamEvent::Completed).await;
                                return;
                            }
                            Some(Err(e)) => {
                                warn!(error = %e, "llm gateway stream error");
                                let _ = tx
                                    .send(StreamEvent::Error(LlmGatewayError::Transport(
                                        e.to_string(),
                                    )))
                                    .await;
                                event_source.close();
                                return;
                            }
                        }
                    }
                }
            }
        });

        Ok(Box::new(HttpStreamHandle {
            token,
            rx: Some(rx),
        }))
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmGatewayError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!("{}/embeddings", self.config.base_url);
        let body = EmbeddingRequest {
            model: &self.config.embedding_model,
            input: texts,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmGatewayError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(LlmGatewayError::Provider(format!(
                "embeddings request failed with status {}",
                response.status()
            )));
        }

        let mut parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| LlmGatewayError::MalformedResponse(e.to_string()))?;

        if parsed.data.len() != texts.len() {
            return Err(LlmGatewayError::MalformedResponse(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                parsed.data.len()
            )));
        }

        parsed.data.sort_by_key(|d| d.index);
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }

    async fn generate_structured(&self, prompt: &str) -> Result<String, LlmGatewayError> {
        let body = self.chat_request_body(prompt, None, false);
        let url = format!("{}/chat/completions", self.config.base_url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmGatewayError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(LlmGatewayError::Provider(format!(
                "chat completion request failed with status {}",
                response.status()
            )));
        }

        let completion: ChatCompletion = response
            .json()
            .await
            .map_err(|e| LlmGatewayError::MalformedResponse(e.to_string()))?;

        completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| {
                LlmGatewayError::MalformedResponse("no choices in completion response".to_string())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_request_body_includes_instructions() {
        let gateway = HttpLlmGateway::new(GatewayConfig {
            base_url: "http://localhost".to_string(),
            api_key: "key".to_string(),
            chat_model: "gpt-4o-mini".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
        });

        let body = gateway.chat_request_body("hello", Some("be nice"), true);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hello");
        assert_eq!(body["stream"], true);
    }

    #[test]
    fn structured_requests_clamp_temperature_to_zero() {
        let gateway = HttpLlmGateway::new(GatewayConfig {
            base_url: "http://localhost".to_string(),
            api_key: "key".to_string(),
            chat_model: "gpt-4o-mini".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
        });

        let body = gateway.chat_request_body("hello", None, false);
        assert_eq!(body["temperature"], 0.0);
    }
}
