//! Routing and adaptation core for a multi-provider LLM gateway.
//!
//! The crate connects four pieces:
//!
//! - [`registry::ProviderRegistry`]: configured providers, their credential
//!   pools, and the model route table mapping bare and qualified
//!   (`provider,model`) names to a serving provider.
//! - [`keys::KeySelector`]: per-provider API key rotation with round-robin,
//!   random, and failover strategies, including failure feedback.
//! - [`transform::TransformerChain`]: ordered adapter chains that translate
//!   between the unified chat wire format and each provider's native one.
//! - [`transform::gemini::GeminiTransformer`]: the built-in adapter for the
//!   Google Gemini `generateContent` API, buffered and streaming.
//!
//! Typical flow: load [`config::ProviderConfig`]s into a registry, resolve an
//! incoming model name to a route, select a key, run the route's chain over
//! the request, send it, and run the chain back over the response.

pub mod config;
pub mod error;
pub mod keys;
pub mod registry;
pub mod transform;
pub mod types;

pub use config::{ApiKeys, KeyStrategy, ProviderConfig, TransformerSetting, TransformerSpec};
pub use error::GatewayError;
pub use keys::{KeySelector, SelectedKey};
pub use registry::{Provider, ProviderRegistry, ProviderUpdate, RouteResolution};
pub use transform::{
    RawResponse, RequestContext, Transformer, TransformerChain, TransformerRegistry,
    UnifiedResponse, WireRequest,
};
pub use types::{ChatChunk, ChatMessage, ChatRequest, ChatResponse, ModelList};
