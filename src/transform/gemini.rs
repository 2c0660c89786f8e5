//! Gemini-style adapter: the worked example of the transformer contract.
//!
//! Outbound, the unified payload becomes a Gemini generate-content body, the
//! URL becomes `<base>/<model>:<action>` with the action chosen by the
//! streaming flag, and the credential moves from the transport-default bearer
//! header into `x-goog-api-key`. Inbound, conversion is delegated to the
//! shared generate-content shaping in [`response`](super::response).

use http::header::{self, HeaderValue};
use serde_json::{json, Value};

use crate::error::GatewayError;
use crate::transform::{
    join_url, response, RawResponse, RequestContext, Transformer, UnifiedResponse, WireRequest,
};
use crate::types::{ChatMessage, ChatRequest, ContentPart, MessageContent, MessageRole, Tool};

pub const TRANSFORMER_NAME: &str = "gemini";

/// Header carrying the Gemini API credential.
const API_KEY_HEADER: &str = "x-goog-api-key";

#[derive(Debug, Default)]
pub struct GeminiTransformer;

impl GeminiTransformer {
    pub fn new() -> Self {
        Self
    }

    /// Convert one unified message into a Gemini `contents` entry. System
    /// messages return `None`; they travel as `systemInstruction`.
    fn convert_message(msg: &ChatMessage) -> Option<Value> {
        match msg.role {
            MessageRole::System => None,

            MessageRole::User => {
                let parts = Self::user_parts(msg);
                Some(json!({ "role": "user", "parts": Self::non_empty(parts) }))
            }

            MessageRole::Assistant => {
                let mut parts = Vec::new();
                if let Some(content) = &msg.content {
                    let text = content.as_text();
                    if !text.is_empty() {
                        parts.push(json!({ "text": text }));
                    }
                }
                // Prior tool calls replay as functionCall parts.
                if let Some(tool_calls) = &msg.tool_calls {
                    for call in tool_calls {
                        let args: Value =
                            serde_json::from_str(&call.function.arguments).unwrap_or(json!({}));
                        parts.push(json!({
                            "functionCall": { "name": call.function.name, "args": args }
                        }));
                    }
                }
                Some(json!({ "role": "model", "parts": Self::non_empty(parts) }))
            }

            MessageRole::Tool => {
                let name = msg
                    .name
                    .clone()
                    .or_else(|| msg.tool_call_id.clone())
                    .unwrap_or_else(|| "function".to_string());
                let result = msg.content.as_ref().map(MessageContent::as_text).unwrap_or_default();
                Some(json!({
                    "role": "user",
                    "parts": [{
                        "functionResponse": { "name": name, "response": { "result": result } }
                    }]
                }))
            }
        }
    }

    fn user_parts(msg: &ChatMessage) -> Vec<Value> {
        match &msg.content {
            Some(MessageContent::Text(text)) => vec![json!({ "text": text })],
            Some(MessageContent::Parts(parts)) => parts
                .iter()
                .map(|part| match part {
                    ContentPart::Text { text } => json!({ "text": text }),
                    ContentPart::ImageUrl { image_url } => {
                        // Data URIs inline; anything else is a file reference.
                        match image_url.url.strip_prefix("data:").and_then(|rest| {
                            let (media_type, data) = rest.split_once(";base64,")?;
                            Some((media_type.to_string(), data.to_string()))
                        }) {
                            Some((media_type, data)) => json!({
                                "inlineData": { "mimeType": media_type, "data": data }
                            }),
                            None => json!({
                                "fileData": { "mimeType": "image/*", "fileUri": image_url.url }
                            }),
                        }
                    }
                })
                .collect(),
            None => Vec::new(),
        }
    }

    /// Gemini rejects empty parts arrays; pad with a blank text part.
    fn non_empty(parts: Vec<Value>) -> Vec<Value> {
        if parts.is_empty() {
            vec![json!({ "text": " " })]
        } else {
            parts
        }
    }

    fn convert_tools(tools: &[Tool]) -> Value {
        let declarations: Vec<Value> = tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.function.name,
                    "description": tool.function.description,
                    "parameters": tool.function.parameters,
                })
            })
            .collect();
        json!([{ "functionDeclarations": declarations }])
    }

    /// Build the Gemini request body from a unified request.
    fn build_body(request: &ChatRequest) -> Value {
        let mut body = json!({});

        let system_text: Vec<String> = request
            .messages
            .iter()
            .filter(|m| m.role == MessageRole::System)
            .filter_map(|m| m.content.as_ref().map(MessageContent::as_text))
            .filter(|t| !t.is_empty())
            .collect();
        if !system_text.is_empty() {
            body["systemInstruction"] =
                json!({ "parts": [{ "text": system_text.join("\n\n") }] });
        }

        let contents: Vec<Value> = request
            .messages
            .iter()
            .filter_map(Self::convert_message)
            .collect();
        body["contents"] = json!(contents);

        let mut generation = json!({});
        if let Some(temperature) = request.temperature {
            generation["temperature"] = json!(temperature);
        }
        if let Some(top_p) = request.top_p {
            generation["topP"] = json!(top_p);
        }
        if let Some(max_tokens) = request.max_tokens {
            generation["maxOutputTokens"] = json!(max_tokens);
        }
        if let Some(stop) = &request.stop {
            let sequences = stop.to_vec();
            if !sequences.is_empty() {
                generation["stopSequences"] = json!(sequences);
            }
        }
        if generation != json!({}) {
            body["generationConfig"] = generation;
        }

        if let Some(tools) = &request.tools {
            if !tools.is_empty() {
                body["tools"] = Self::convert_tools(tools);
            }
        }

        body
    }
}

impl Transformer for GeminiTransformer {
    fn name(&self) -> &'static str {
        TRANSFORMER_NAME
    }

    fn transform_request_in(
        &self,
        wire: WireRequest,
        ctx: &RequestContext<'_>,
    ) -> Result<WireRequest, GatewayError> {
        let request: ChatRequest = serde_json::from_value(wire.body)?;

        let action = if request.stream {
            "streamGenerateContent?alt=sse"
        } else {
            "generateContent"
        };
        let url = join_url(ctx.base_url, &format!("{}:{}", ctx.model, action))?;

        let mut headers = wire.headers;
        // Gemini authenticates via its own header, never a bearer token.
        headers.remove(header::AUTHORIZATION);
        let key = HeaderValue::from_str(ctx.api_key)
            .map_err(|e| GatewayError::Transform(format!("invalid API key header: {e}")))?;
        headers.insert(API_KEY_HEADER, key);

        Ok(WireRequest {
            url,
            headers,
            body: Self::build_body(&request),
            stream: request.stream,
        })
    }

    fn transform_response_out(&self, raw: RawResponse) -> Result<UnifiedResponse, GatewayError> {
        response::unify_generate_content(self.name(), raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::TransformerChain;
    use crate::types::{ImageUrl, StopSequence};
    use serde_json::json;
    use std::sync::Arc;

    fn ctx<'a>() -> RequestContext<'a> {
        RequestContext {
            provider_name: "gemini",
            base_url: "https://generativelanguage.googleapis.com/v1beta/models",
            api_key: "AIza-test",
            model: "gemini-2.5-flash",
        }
    }

    fn chain() -> TransformerChain {
        TransformerChain::new(vec![Arc::new(GeminiTransformer::new())])
    }

    #[test]
    fn test_url_and_credential_placement() {
        let request = ChatRequest::simple("gemini-2.5-flash", "Hi");
        let wire = chain().prepare_request(&request, &ctx()).expect("wire");

        assert_eq!(
            wire.url.as_str(),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-flash:generateContent"
        );
        assert_eq!(
            wire.headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()),
            Some("AIza-test")
        );
        // The transport-default bearer header must be gone.
        assert!(wire.headers.get(header::AUTHORIZATION).is_none());
    }

    #[test]
    fn test_streaming_action_suffix() {
        let mut request = ChatRequest::simple("gemini-2.5-flash", "Hi");
        request.stream = true;
        let wire = chain().prepare_request(&request, &ctx()).expect("wire");

        assert!(wire.stream);
        assert!(wire
            .url
            .as_str()
            .ends_with("gemini-2.5-flash:streamGenerateContent?alt=sse"));
    }

    #[test]
    fn test_body_contents_and_system_instruction() {
        let request: ChatRequest = serde_json::from_value(json!({
            "model": "gemini-2.5-flash",
            "messages": [
                {"role": "system", "content": "Be brief."},
                {"role": "user", "content": "Hello"},
                {"role": "assistant", "content": "Hi!"},
                {"role": "user", "content": "Bye"}
            ]
        }))
        .expect("request");

        let wire = chain().prepare_request(&request, &ctx()).expect("wire");
        let body = &wire.body;

        assert_eq!(
            body["systemInstruction"]["parts"][0]["text"],
            json!("Be brief.")
        );
        let contents = body["contents"].as_array().expect("contents");
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[0]["role"], json!("user"));
        assert_eq!(contents[1]["role"], json!("model"));
        assert_eq!(contents[2]["role"], json!("user"));
    }

    #[test]
    fn test_generation_config_mapping() {
        let mut request = ChatRequest::simple("gemini-2.5-flash", "Hi");
        request.temperature = Some(0.4);
        request.top_p = Some(0.9);
        request.max_tokens = Some(2048);
        request.stop = Some(StopSequence::Multiple(vec!["END".into()]));

        let wire = chain().prepare_request(&request, &ctx()).expect("wire");
        let generation = &wire.body["generationConfig"];
        assert_eq!(generation["maxOutputTokens"], json!(2048));
        assert_eq!(generation["topP"], json!(0.9));
        assert_eq!(generation["stopSequences"], json!(["END"]));
    }

    #[test]
    fn test_tools_become_function_declarations() {
        let request: ChatRequest = serde_json::from_value(json!({
            "model": "gemini-2.5-flash",
            "messages": [{"role": "user", "content": "Weather?"}],
            "tools": [{
                "type": "function",
                "function": {
                    "name": "get_weather",
                    "description": "Get the weather",
                    "parameters": {"type": "object", "properties": {"city": {"type": "string"}}}
                }
            }]
        }))
        .expect("request");

        let wire = chain().prepare_request(&request, &ctx()).expect("wire");
        let declarations = &wire.body["tools"][0]["functionDeclarations"];
        assert_eq!(declarations[0]["name"], json!("get_weather"));
    }

    #[test]
    fn test_tool_result_message_roundtrip() {
        let request: ChatRequest = serde_json::from_value(json!({
            "model": "gemini-2.5-flash",
            "messages": [
                {"role": "user", "content": "Weather?"},
                {"role": "assistant", "tool_calls": [{
                    "id": "call_1", "type": "function",
                    "function": {"name": "get_weather", "arguments": "{\"city\":\"Oslo\"}"}
                }]},
                {"role": "tool", "tool_call_id": "get_weather", "content": "12C"}
            ]
        }))
        .expect("request");

        let wire = chain().prepare_request(&request, &ctx()).expect("wire");
        let contents = wire.body["contents"].as_array().expect("contents");

        let call_part = &contents[1]["parts"][0]["functionCall"];
        assert_eq!(call_part["name"], json!("get_weather"));
        assert_eq!(call_part["args"], json!({"city": "Oslo"}));

        let result_part = &contents[2]["parts"][0]["functionResponse"];
        assert_eq!(result_part["response"]["result"], json!("12C"));
    }

    #[test]
    fn test_inline_image_data_uri() {
        let msg = ChatMessage {
            role: MessageRole::User,
            content: Some(MessageContent::Parts(vec![ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: "data:image/png;base64,AAAA".into(),
                    detail: None,
                },
            }])),
            name: None,
            tool_calls: None,
            tool_call_id: None,
        };

        let converted = GeminiTransformer::convert_message(&msg).expect("content");
        assert_eq!(
            converted["parts"][0]["inlineData"],
            json!({"mimeType": "image/png", "data": "AAAA"})
        );
    }

    #[test]
    fn test_empty_message_padded() {
        let msg = ChatMessage {
            role: MessageRole::User,
            content: None,
            name: None,
            tool_calls: None,
            tool_call_id: None,
        };
        let converted = GeminiTransformer::convert_message(&msg).expect("content");
        assert_eq!(converted["parts"][0]["text"], json!(" "));
    }
}
