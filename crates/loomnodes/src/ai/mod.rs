//! AI provider executors: chat (with a streaming sub-mode), embeddings,
//! and image generation against an OpenAI-compatible API.
//!
//! The credential is never chosen here: the caller places it into the
//! run's input map under the node's reserved key, and the only thing this
//! module does with it is send it — redaction on the way out is the
//! engine's job.

mod sse;

pub use sse::{SseEvent, SseParser};

use async_trait::async_trait;
use futures::StreamExt;
use loomcore::{ExecutionMeta, Node, NodeContext, NodeError, NodeOutput, Value};
use loomruntime::{NodeFactory, NodeTypeInfo};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_CHAT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_EMBEDDINGS_MODEL: &str = "text-embedding-3-small";
const DEFAULT_IMAGE_MODEL: &str = "gpt-image-1";

fn base_url(ctx: &NodeContext) -> String {
    ctx.config_str("baseUrl")
        .map(|u| u.trim_end_matches('/').to_string())
        .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
}

fn credential(ctx: &NodeContext) -> Result<String, NodeError> {
    ctx.credential().map(str::to_string).ok_or_else(|| {
        NodeError::provider(
            format!("no credential injected for node '{}'", ctx.node_id),
            false,
        )
    })
}

fn prompt_input(ctx: &NodeContext) -> Result<String, NodeError> {
    ctx.inputs
        .get("prompt")
        .or_else(|| ctx.primary_input())
        .or_else(|| ctx.config.get("prompt"))
        .and_then(|v| v.as_str().map(str::to_string))
        .ok_or_else(|| NodeError::MissingInput("prompt".into()))
}

fn transport_error(e: reqwest::Error) -> NodeError {
    let retryable = e.is_timeout() || e.is_connect() || e.is_request();
    NodeError::provider(format!("provider request failed: {}", e), retryable)
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, NodeError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let retryable = status.is_server_error() || status.as_u16() == 429;
    let mut body = response.text().await.unwrap_or_default();
    body.truncate(300);
    Err(NodeError::provider(
        format!("provider returned {}: {}", status, body),
        retryable,
    ))
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    #[serde(default)]
    total_tokens: Option<u64>,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Text generation via the chat completions endpoint. With `stream: true`
/// partial tokens surface through the progress emitter as they arrive.
pub struct AiChatNode;

#[async_trait]
impl Node for AiChatNode {
    fn spec_id(&self) -> &str {
        "ai-chat"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let prompt = prompt_input(&ctx)?;
        let key = credential(&ctx)?;
        let model = ctx
            .config_str("model")
            .unwrap_or_else(|| DEFAULT_CHAT_MODEL.to_string());
        let max_tokens = ctx
            .config
            .get("maxTokens")
            .and_then(|v| v.as_f64())
            .unwrap_or(1024.0) as u32;
        let temperature = ctx
            .config
            .get("temperature")
            .and_then(|v| v.as_f64())
            .map(|t| t as f32);
        let stream = ctx
            .config
            .get("stream")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let request = ChatRequest {
            model: &model,
            messages: vec![ChatMessage {
                role: "user",
                content: &prompt,
            }],
            max_tokens,
            temperature,
            stream,
            stream_options: stream.then(|| StreamOptions {
                include_usage: true,
            }),
        };

        let response = reqwest::Client::new()
            .post(format!("{}/chat/completions", base_url(&ctx)))
            .bearer_auth(&key)
            .json(&request)
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(response).await?;

        let mut meta = ExecutionMeta {
            tokens: None,
            model: Some(model.clone()),
        };

        let text = if stream {
            let mut body = response.bytes_stream();
            let mut parser = SseParser::new();
            let mut text = String::new();
            while let Some(chunk) = body.next().await {
                let bytes =
                    chunk.map_err(|e| NodeError::provider(format!("stream error: {}", e), true))?;
                for event in parser.feed(&String::from_utf8_lossy(&bytes)) {
                    if event.data.trim() == "[DONE]" {
                        continue;
                    }
                    let Ok(chunk) = serde_json::from_str::<StreamChunk>(&event.data) else {
                        continue;
                    };
                    if let Some(delta) =
                        chunk.choices.first().and_then(|c| c.delta.content.clone())
                    {
                        ctx.events.token(delta.clone());
                        text.push_str(&delta);
                    }
                    if let Some(total) = chunk.usage.and_then(|u| u.total_tokens) {
                        meta.tokens = Some(total);
                    }
                }
            }
            text
        } else {
            let parsed: ChatResponse = response.json().await.map_err(transport_error)?;
            meta.tokens = parsed.usage.and_then(|u| u.total_tokens);
            if let Some(served_model) = parsed.model {
                meta.model = Some(served_model);
            }
            parsed
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.message.content)
                .ok_or_else(|| NodeError::provider("provider returned no choices", false))?
        };

        Ok(NodeOutput::value(text).with_meta(meta))
    }
}

pub struct AiChatNodeFactory;

impl NodeFactory for AiChatNodeFactory {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(AiChatNode))
    }

    fn spec_id(&self) -> &str {
        "ai-chat"
    }

    fn metadata(&self) -> NodeTypeInfo {
        NodeTypeInfo {
            description: "Generate text with a chat model".to_string(),
            category: "ai".to_string(),
        }
    }
}

#[derive(Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    #[serde(default)]
    data: Vec<EmbeddingItem>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    embedding: Vec<f64>,
}

/// Embeds the input text into a vector.
pub struct AiEmbeddingsNode;

#[async_trait]
impl Node for AiEmbeddingsNode {
    fn spec_id(&self) -> &str {
        "ai-embeddings"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let input = ctx
            .primary_input()
            .or_else(|| ctx.config.get("input"))
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or_else(|| NodeError::MissingInput("input".into()))?;
        let key = credential(&ctx)?;
        let model = ctx
            .config_str("model")
            .unwrap_or_else(|| DEFAULT_EMBEDDINGS_MODEL.to_string());

        let response = reqwest::Client::new()
            .post(format!("{}/embeddings", base_url(&ctx)))
            .bearer_auth(&key)
            .json(&EmbeddingsRequest {
                model: &model,
                input: &input,
            })
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(response).await?;
        let parsed: EmbeddingsResponse = response.json().await.map_err(transport_error)?;

        let embedding = parsed
            .data
            .into_iter()
            .next()
            .map(|item| Value::Array(item.embedding.into_iter().map(Value::Number).collect()))
            .ok_or_else(|| NodeError::provider("provider returned no embedding", false))?;

        let meta = ExecutionMeta {
            tokens: parsed.usage.and_then(|u| u.total_tokens),
            model: parsed.model.or(Some(model)),
        };
        Ok(NodeOutput::value(embedding).with_meta(meta))
    }
}

pub struct AiEmbeddingsNodeFactory;

impl NodeFactory for AiEmbeddingsNodeFactory {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(AiEmbeddingsNode))
    }

    fn spec_id(&self) -> &str {
        "ai-embeddings"
    }

    fn metadata(&self) -> NodeTypeInfo {
        NodeTypeInfo {
            description: "Embed text into a vector".to_string(),
            category: "ai".to_string(),
        }
    }
}

#[derive(Serialize)]
struct ImageRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    n: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    size: Option<String>,
}

#[derive(Deserialize)]
struct ImageResponse {
    #[serde(default)]
    data: Vec<ImageItem>,
}

#[derive(Deserialize)]
struct ImageItem {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    b64_json: Option<String>,
}

/// Generates one image from a prompt; the output is the image URL or the
/// base64 payload, whichever the provider returned.
pub struct AiImageNode;

#[async_trait]
impl Node for AiImageNode {
    fn spec_id(&self) -> &str {
        "ai-image"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let prompt = prompt_input(&ctx)?;
        let key = credential(&ctx)?;
        let model = ctx
            .config_str("model")
            .unwrap_or_else(|| DEFAULT_IMAGE_MODEL.to_string());

        let response = reqwest::Client::new()
            .post(format!("{}/images/generations", base_url(&ctx)))
            .bearer_auth(&key)
            .json(&ImageRequest {
                model: &model,
                prompt: &prompt,
                n: 1,
                size: ctx.config_str("size"),
            })
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(response).await?;
        let parsed: ImageResponse = response.json().await.map_err(transport_error)?;

        let image = parsed
            .data
            .into_iter()
            .next()
            .ok_or_else(|| NodeError::provider("provider returned no image", false))?;
        let value = image
            .url
            .or(image.b64_json)
            .map(Value::String)
            .ok_or_else(|| NodeError::provider("image payload missing url and data", false))?;

        let meta = ExecutionMeta {
            tokens: None,
            model: Some(model),
        };
        Ok(NodeOutput::value(value).with_meta(meta))
    }
}

pub struct AiImageNodeFactory;

impl NodeFactory for AiImageNodeFactory {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(AiImageNode))
    }

    fn spec_id(&self) -> &str {
        "ai-image"
    }

    fn metadata(&self) -> NodeTypeInfo {
        NodeTypeInfo {
            description: "Generate an image from a prompt".to_string(),
            category: "ai".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::context_with_ports;
    use loomcore::credential_key;

    #[tokio::test]
    async fn chat_without_credential_is_provider_error() {
        let ctx = context_with_ports(vec![("prompt", Value::String("hello".into()))]);
        let err = AiChatNode.execute(ctx).await.unwrap_err();
        assert!(matches!(err, NodeError::Provider { retryable: false, .. }));
    }

    #[tokio::test]
    async fn chat_without_prompt_is_missing_input() {
        let mut ctx = context_with_ports(vec![]);
        std::sync::Arc::get_mut(&mut ctx.flow_inputs)
            .unwrap()
            .insert(credential_key("n1"), Value::String("sk-test-xyz".into()));
        let err = AiChatNode.execute(ctx).await.unwrap_err();
        assert!(matches!(err, NodeError::MissingInput(_)));
    }

    #[test]
    fn chat_request_serializes_stream_options_only_when_streaming() {
        let request = ChatRequest {
            model: "m",
            messages: vec![ChatMessage {
                role: "user",
                content: "hi",
            }],
            max_tokens: 16,
            temperature: None,
            stream: false,
            stream_options: None,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("stream_options").is_none());
        assert_eq!(json["messages"][0]["role"], "user");
    }
}
