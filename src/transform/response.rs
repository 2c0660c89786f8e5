//! Shared response shaping.
//!
//! Adapters that speak a Gemini-style generate-content dialect delegate their
//! response conversion here, passing their own name so the produced ids record
//! which adapter shaped the response. The unified-shape decoder at the bottom
//! backs the default [`Transformer`](super::Transformer) response hook.

use chrono::Utc;
use futures::StreamExt;
use serde_json::Value;
use uuid::Uuid;

use crate::error::GatewayError;
use crate::transform::{sse, RawResponse, UnifiedResponse};
use crate::types::{
    ChatChunk, ChatResponse, Choice, ChunkChoice, Delta, FunctionCall, ResponseMessage, ToolCall,
    Usage,
};

/// Map a Gemini finish reason onto the unified vocabulary.
fn map_finish_reason(reason: &str) -> &'static str {
    match reason {
        "MAX_TOKENS" => "length",
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII" => "content_filter",
        _ => "stop",
    }
}

/// Shape a Gemini-style raw response into the unified shape, buffered or
/// streaming. `source` is the adapter name stamped into response ids.
pub(crate) fn unify_generate_content(
    source: &'static str,
    raw: RawResponse,
) -> Result<UnifiedResponse, GatewayError> {
    match raw {
        RawResponse::Json(value) => {
            let response = shape_buffered(source, &value)?;
            Ok(UnifiedResponse::Complete(Box::new(response)))
        }
        RawResponse::Sse(bytes) => {
            let shaper = ChunkShaper::new(source);
            let chunks = sse::data_events(bytes)
                .scan(shaper, |shaper, item| {
                    let out = match item {
                        Ok(payload) => shaper.shape(&payload).transpose(),
                        Err(error) => Some(Err(error)),
                    };
                    futures::future::ready(Some(out))
                })
                .filter_map(futures::future::ready);
            Ok(UnifiedResponse::Stream(Box::pin(chunks)))
        }
    }
}

/// Buffered Gemini JSON body -> unified response. The model name is taken
/// from the payload's `modelVersion` field.
fn shape_buffered(source: &'static str, value: &Value) -> Result<ChatResponse, GatewayError> {
    let candidates = value["candidates"]
        .as_array()
        .ok_or_else(|| GatewayError::Transform("missing candidates array".into()))?;

    let mut choices = Vec::with_capacity(candidates.len());
    for (index, candidate) in candidates.iter().enumerate() {
        let (content, tool_calls) = collect_parts(&candidate["content"]["parts"]);
        let finish_reason = candidate["finishReason"]
            .as_str()
            .map(|r| map_finish_reason(r).to_string());

        choices.push(Choice {
            index: index as u32,
            message: ResponseMessage {
                role: "assistant".to_string(),
                content,
                tool_calls,
            },
            finish_reason,
        });
    }

    Ok(ChatResponse {
        id: response_id(source),
        object: "chat.completion".to_string(),
        created: Utc::now().timestamp(),
        model: value["modelVersion"].as_str().unwrap_or_default().to_string(),
        choices,
        usage: read_usage(&value["usageMetadata"]).unwrap_or_default(),
    })
}

/// Gather text and function-call parts from one candidate.
fn collect_parts(parts: &Value) -> (Option<String>, Option<Vec<ToolCall>>) {
    let Some(parts) = parts.as_array() else {
        return (None, None);
    };

    let mut text = String::new();
    let mut tool_calls = Vec::new();

    for part in parts {
        if let Some(t) = part["text"].as_str() {
            text.push_str(t);
        }
        if let Some(call) = part.get("functionCall") {
            let arguments = serde_json::to_string(&call["args"]).unwrap_or_else(|_| "{}".into());
            tool_calls.push(ToolCall {
                id: format!("call_{}", Uuid::new_v4()),
                r#type: "function".to_string(),
                function: FunctionCall {
                    name: call["name"].as_str().unwrap_or_default().to_string(),
                    arguments,
                },
            });
        }
    }

    let content = if text.is_empty() { None } else { Some(text) };
    let tool_calls = if tool_calls.is_empty() {
        None
    } else {
        Some(tool_calls)
    };
    (content, tool_calls)
}

fn read_usage(meta: &Value) -> Option<Usage> {
    meta.as_object()?;
    let prompt_tokens = clamped_count(&meta["promptTokenCount"]);
    let completion_tokens = clamped_count(&meta["candidatesTokenCount"]);
    let total_tokens = match meta["totalTokenCount"].as_u64() {
        Some(total) => u32::try_from(total).unwrap_or(u32::MAX),
        None => prompt_tokens.saturating_add(completion_tokens),
    };
    Some(Usage {
        prompt_tokens,
        completion_tokens,
        total_tokens,
    })
}

/// Counts come straight off the wire; clamp instead of trusting them to fit.
fn clamped_count(value: &Value) -> u32 {
    value
        .as_u64()
        .map_or(0, |n| u32::try_from(n).unwrap_or(u32::MAX))
}

fn response_id(source: &str) -> String {
    format!("{source}-{}", Uuid::new_v4())
}

/// Stateful converter for one Gemini SSE stream: keeps a stable chunk id,
/// accumulates usage counters, and attaches them to the finishing chunk.
struct ChunkShaper {
    id: String,
    model: String,
    created: i64,
    usage: Usage,
}

impl ChunkShaper {
    fn new(source: &'static str) -> Self {
        Self {
            id: response_id(source),
            model: String::new(),
            created: Utc::now().timestamp(),
            usage: Usage::default(),
        }
    }

    /// One SSE payload -> at most one unified chunk.
    fn shape(&mut self, payload: &str) -> Result<Option<ChatChunk>, GatewayError> {
        let event: Value = serde_json::from_str(payload)
            .map_err(|e| GatewayError::Stream(format!("invalid JSON in stream: {e}")))?;

        if let Some(model) = event["modelVersion"].as_str() {
            self.model = model.to_string();
        }
        if let Some(usage) = read_usage(&event["usageMetadata"]) {
            self.usage = usage;
        }

        let Some(candidate) = event["candidates"].as_array().and_then(|c| c.first()) else {
            return Ok(None);
        };

        let (content, tool_calls) = collect_parts(&candidate["content"]["parts"]);
        let finish_reason = candidate["finishReason"]
            .as_str()
            .map(|r| map_finish_reason(r).to_string());

        if content.is_none() && tool_calls.is_none() && finish_reason.is_none() {
            return Ok(None);
        }

        let finished = finish_reason.is_some();
        Ok(Some(ChatChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: Delta {
                    role: None,
                    content,
                    tool_calls,
                },
                finish_reason,
            }],
            usage: finished.then(|| self.usage.clone()),
        }))
    }
}

/// Decode a payload that is already unified-shaped (the empty-chain and
/// passthrough-adapter case).
pub(crate) fn decode_unified(raw: RawResponse) -> Result<UnifiedResponse, GatewayError> {
    match raw {
        RawResponse::Json(value) => {
            let response: ChatResponse = serde_json::from_value(value)?;
            Ok(UnifiedResponse::Complete(Box::new(response)))
        }
        RawResponse::Sse(bytes) => {
            let chunks = sse::data_events(bytes).map(|item| {
                item.and_then(|payload| {
                    serde_json::from_str::<ChatChunk>(&payload)
                        .map_err(|e| GatewayError::Stream(format!("invalid chunk JSON: {e}")))
                })
            });
            Ok(UnifiedResponse::Stream(Box::pin(chunks)))
        }
    }
}
