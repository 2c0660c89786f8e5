//! Transformer abstraction: unified shape <-> provider wire format.
//!
//! A provider's transformer chain is an ordered sequence of named adapters,
//! resolved once at registration time against a [`TransformerRegistry`]. On
//! the way out the chain folds a transport-default wire request through every
//! adapter in order; on the way in the wire-nearest adapter converts the
//! provider's raw response back into the unified shape.

pub mod gemini;
pub mod response;
pub mod sse;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures::Stream;
use http::header::{self, HeaderMap, HeaderValue};
use tracing::warn;
use url::Url;

use crate::config::TransformerSpec;
use crate::error::GatewayError;
use crate::types::{ChatChunk, ChatRequest, ChatResponse};

pub use gemini::GeminiTransformer;
pub use sse::{SseEvent, SseParser};

// ---------------------------------------------------------------------------
// Boundary types
// ---------------------------------------------------------------------------

/// Raw bytes arriving from the provider's HTTP response body.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, GatewayError>> + Send>>;

/// Lazy sequence of unified streaming chunks.
///
/// Dropping the stream drops the upstream byte stream with it, so a consumer
/// that stops pulling releases the underlying connection promptly.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<ChatChunk, GatewayError>> + Send>>;

/// Per-call context handed to request transformation.
///
/// Credential selection happens in the registry before the chain runs; the
/// chosen key arrives here so adapters only decide *where* to place it.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext<'a> {
    pub provider_name: &'a str,
    pub base_url: &'a str,
    pub api_key: &'a str,
    /// Target model name (qualified prefix already stripped).
    pub model: &'a str,
}

/// The outbound call in provider wire form: payload plus transport parameters.
#[derive(Debug, Clone)]
pub struct WireRequest {
    pub url: Url,
    pub headers: HeaderMap,
    pub body: serde_json::Value,
    /// Whether the transport should treat the response as an SSE stream.
    pub stream: bool,
}

/// A provider's raw HTTP response, before unification.
pub enum RawResponse {
    /// Fully buffered JSON body.
    Json(serde_json::Value),
    /// Streaming SSE body.
    Sse(ByteStream),
}

/// The response in unified shape.
pub enum UnifiedResponse {
    Complete(Box<ChatResponse>),
    Stream(ChunkStream),
}

impl UnifiedResponse {
    pub fn is_stream(&self) -> bool {
        matches!(self, Self::Stream(_))
    }
}

// ---------------------------------------------------------------------------
// Transformer trait
// ---------------------------------------------------------------------------

/// One resolved adapter in a provider's chain.
///
/// Every hook has a passthrough default so middleware-style adapters override
/// only the direction they touch. Hooks consume and return their payloads;
/// nothing shared is mutated.
pub trait Transformer: Send + Sync {
    /// Adapter name, recorded in response metadata and used for registry
    /// lookups.
    fn name(&self) -> &'static str;

    /// Rewrite the outbound wire request: payload shape, target URL, headers,
    /// credential placement.
    fn transform_request_in(
        &self,
        wire: WireRequest,
        _ctx: &RequestContext<'_>,
    ) -> Result<WireRequest, GatewayError> {
        Ok(wire)
    }

    /// Inverse direction: recover a unified request from a provider-native
    /// body (compatibility shims running the chain in reverse).
    fn transform_request_out(&self, body: serde_json::Value) -> Result<ChatRequest, GatewayError> {
        Ok(serde_json::from_value(body)?)
    }

    /// Convert the provider's raw response, streaming or not, into the
    /// unified shape. The default decodes payloads that are already
    /// unified-shaped.
    fn transform_response_out(&self, raw: RawResponse) -> Result<UnifiedResponse, GatewayError> {
        response::decode_unified(raw)
    }
}

// ---------------------------------------------------------------------------
// Transformer chain
// ---------------------------------------------------------------------------

/// Ordered sequence of resolved adapters attached to one provider (or to one
/// of its models, when a model override chain is configured).
#[derive(Clone, Default)]
pub struct TransformerChain {
    transformers: Vec<Arc<dyn Transformer>>,
}

impl TransformerChain {
    pub fn new(transformers: Vec<Arc<dyn Transformer>>) -> Self {
        Self { transformers }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.transformers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.transformers.len()
    }

    /// Adapter names in application order.
    pub fn names(&self) -> Vec<&'static str> {
        self.transformers.iter().map(|t| t.name()).collect()
    }

    /// Produce the provider wire request for a unified request.
    ///
    /// Seeds the fold with the transport default (OpenAI-style
    /// `/chat/completions` plus bearer credential) and applies every adapter
    /// in order; adapters replace whichever transport parameters their
    /// provider does differently.
    pub fn prepare_request(
        &self,
        request: &ChatRequest,
        ctx: &RequestContext<'_>,
    ) -> Result<WireRequest, GatewayError> {
        let mut wire = default_wire(request, ctx)?;
        for transformer in &self.transformers {
            wire = transformer.transform_request_in(wire, ctx)?;
        }
        Ok(wire)
    }

    /// Convert the provider's raw response into the unified shape.
    ///
    /// The wire-nearest (last) adapter owns the raw-to-unified conversion;
    /// with an empty chain the payload is expected to already be
    /// unified-shaped.
    pub fn unify_response(&self, raw: RawResponse) -> Result<UnifiedResponse, GatewayError> {
        match self.transformers.last() {
            Some(transformer) => transformer.transform_response_out(raw),
            None => response::decode_unified(raw),
        }
    }

    /// Recover a unified request from a provider-native body.
    pub fn recover_request(&self, body: serde_json::Value) -> Result<ChatRequest, GatewayError> {
        match self.transformers.last() {
            Some(transformer) => transformer.transform_request_out(body),
            None => Ok(serde_json::from_value(body)?),
        }
    }
}

impl std::fmt::Debug for TransformerChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("TransformerChain").field(&self.names()).finish()
    }
}

/// Transport-default wire request: OpenAI-style chat completions endpoint
/// with a bearer-token credential. Adapters for providers that differ rewrite
/// or remove these pieces.
fn default_wire(
    request: &ChatRequest,
    ctx: &RequestContext<'_>,
) -> Result<WireRequest, GatewayError> {
    let url = join_url(ctx.base_url, "chat/completions")?;

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    let bearer = HeaderValue::from_str(&format!("Bearer {}", ctx.api_key))
        .map_err(|e| GatewayError::Transform(format!("invalid API key header: {e}")))?;
    headers.insert(header::AUTHORIZATION, bearer);

    let mut outgoing = request.clone();
    outgoing.model = ctx.model.to_string();

    Ok(WireRequest {
        url,
        headers,
        body: serde_json::to_value(&outgoing)?,
        stream: request.stream,
    })
}

/// Join a base URL with a path suffix, tolerating trailing slashes.
pub(crate) fn join_url(base: &str, suffix: &str) -> Result<Url, GatewayError> {
    let joined = format!("{}/{}", base.trim_end_matches('/'), suffix);
    Url::parse(&joined).map_err(|e| GatewayError::Transform(format!("invalid URL '{joined}': {e}")))
}

// ---------------------------------------------------------------------------
// Transformer registry
// ---------------------------------------------------------------------------

/// Factory building one adapter instance from optional per-instance config.
pub type TransformerFactory =
    Box<dyn Fn(Option<&serde_json::Value>) -> Result<Arc<dyn Transformer>, GatewayError> + Send + Sync>;

/// Name-keyed adapter lookup, built explicitly at startup.
///
/// The registry maps adapter names to factories; chain resolution instantiates
/// each [`TransformerSpec`] through its factory. Unresolvable names are
/// dropped from the chain with a warning, never treated as fatal.
pub struct TransformerRegistry {
    factories: HashMap<String, TransformerFactory>,
}

impl TransformerRegistry {
    /// Empty registry. Most callers want [`TransformerRegistry::default`],
    /// which carries the built-in adapters.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a factory under a name, replacing any previous registration.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        factory: impl Fn(Option<&serde_json::Value>) -> Result<Arc<dyn Transformer>, GatewayError>
            + Send
            + Sync
            + 'static,
    ) {
        self.factories.insert(name.into(), Box::new(factory));
    }

    /// Register a configuration-less adapter shared across all chains.
    pub fn register_shared(&mut self, transformer: Arc<dyn Transformer>) {
        let name = transformer.name();
        self.register(name, move |_config| Ok(Arc::clone(&transformer)));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Instantiate one spec, or `None` if the name is unknown or the factory
    /// rejects the supplied config.
    pub fn build(&self, spec: &TransformerSpec) -> Option<Arc<dyn Transformer>> {
        let factory = self.factories.get(spec.name())?;
        match factory(spec.config()) {
            Ok(transformer) => Some(transformer),
            Err(error) => {
                warn!(transformer = spec.name(), %error, "Transformer factory rejected config, dropping from chain");
                None
            }
        }
    }

    /// Resolve an ordered spec sequence into a live chain.
    ///
    /// Unknown names are logged and skipped; a partially-resolved chain is
    /// valid.
    pub fn resolve_chain(&self, specs: &[TransformerSpec]) -> TransformerChain {
        let mut transformers = Vec::with_capacity(specs.len());
        for spec in specs {
            if !self.contains(spec.name()) {
                warn!(transformer = spec.name(), "Unknown transformer, dropping from chain");
                continue;
            }
            if let Some(transformer) = self.build(spec) {
                transformers.push(transformer);
            }
        }
        TransformerChain::new(transformers)
    }
}

impl Default for TransformerRegistry {
    /// Registry with the built-in adapters registered.
    fn default() -> Self {
        let mut registry = Self::new();
        registry.register(gemini::TRANSFORMER_NAME, |_config| {
            Ok(Arc::new(GeminiTransformer::new()) as Arc<dyn Transformer>)
        });
        registry
    }
}
