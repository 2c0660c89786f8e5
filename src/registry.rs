//! Provider registry and model routing.
//!
//! The registry owns every configured provider: its credential pool and key
//! selector, its resolved transformer chains, and the derived route table
//! mapping both bare and qualified model names to the provider that serves
//! them. Mutation (register/update/delete) is rare; route resolution and key
//! selection are the hot path and only ever take read locks.
//!
//! Lock order is always registry table -> provider state -> key cursor;
//! no lock is held across anything that suspends or blocks.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::{KeyStrategy, ProviderConfig, TransformerSetting};
use crate::error::GatewayError;
use crate::keys::{KeySelector, SelectedKey};
use crate::transform::{
    RawResponse, RequestContext, TransformerChain, TransformerRegistry, UnifiedResponse,
    WireRequest,
};
use crate::types::{ChatRequest, ModelInfo, ModelList};

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

/// One configured backend provider.
///
/// Handed out as `Arc<Provider>`; the mutable interior sits behind its own
/// lock so that edits made through the registry are visible to routes that
/// were resolved earlier.
pub struct Provider {
    name: String,
    state: RwLock<ProviderState>,
}

struct ProviderState {
    base_url: String,
    models: Vec<String>,
    key_strategy: KeyStrategy,
    selector: Arc<KeySelector>,
    chain: TransformerChain,
    model_chains: HashMap<String, TransformerChain>,
    enabled: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Provider {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base_url(&self) -> String {
        self.read().base_url.clone()
    }

    pub fn models(&self) -> Vec<String> {
        self.read().models.clone()
    }

    pub fn key_strategy(&self) -> KeyStrategy {
        self.read().key_strategy
    }

    pub fn enabled(&self) -> bool {
        self.read().enabled
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.read().created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.read().updated_at
    }

    /// Choose the credential for the next outbound call. `exclude` carries
    /// the index of a key that just failed, if any.
    pub fn select_key(&self, exclude: Option<usize>) -> Result<SelectedKey, GatewayError> {
        let selector = Arc::clone(&self.read().selector);
        selector.select_key(exclude)
    }

    pub fn key_count(&self) -> usize {
        self.read().selector.key_count()
    }

    /// The transformer chain serving `model`: the model override chain when
    /// one is configured, the provider-wide chain otherwise.
    pub fn chain_for(&self, model: &str) -> TransformerChain {
        let state = self.read();
        state
            .model_chains
            .get(model)
            .cloned()
            .unwrap_or_else(|| state.chain.clone())
    }

    /// Run the outbound half of the chain: unified request in, provider wire
    /// request out. The credential has already been selected by the caller.
    pub fn prepare_request(
        &self,
        request: &ChatRequest,
        target_model: &str,
        api_key: &str,
    ) -> Result<WireRequest, GatewayError> {
        let state = self.read();
        let ctx = RequestContext {
            provider_name: &self.name,
            base_url: &state.base_url,
            api_key,
            model: target_model,
        };
        let chain = state
            .model_chains
            .get(target_model)
            .unwrap_or(&state.chain);
        chain.prepare_request(request, &ctx)
    }

    /// Run the inbound half of the chain: provider raw response in, unified
    /// response out.
    pub fn unify_response(
        &self,
        target_model: &str,
        raw: RawResponse,
    ) -> Result<UnifiedResponse, GatewayError> {
        self.chain_for(target_model).unify_response(raw)
    }

    fn read(&self) -> RwLockReadGuard<'_, ProviderState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, ProviderState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.read();
        f.debug_struct("Provider")
            .field("name", &self.name)
            .field("base_url", &state.base_url)
            .field("models", &state.models)
            .field("key_strategy", &state.key_strategy)
            .field("enabled", &state.enabled)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Updates
// ---------------------------------------------------------------------------

/// Partial provider update: only the populated fields are applied.
///
/// Supplying `api_key` or `api_key_strategy` rebuilds the key selector and
/// resets its rotation state; supplying `models` regenerates the provider's
/// routes under the registration insertion rule.
#[derive(Debug, Default)]
pub struct ProviderUpdate {
    pub api_base_url: Option<String>,
    pub api_key: Option<Vec<String>>,
    pub api_key_strategy: Option<KeyStrategy>,
    pub models: Option<Vec<String>>,
    pub transformer: Option<TransformerSetting>,
    pub enabled: Option<bool>,
}

impl ProviderUpdate {
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = Some(url.into());
        self
    }

    pub fn api_keys(mut self, keys: Vec<String>) -> Self {
        self.api_key = Some(keys);
        self
    }

    pub fn key_strategy(mut self, strategy: KeyStrategy) -> Self {
        self.api_key_strategy = Some(strategy);
        self
    }

    pub fn models(mut self, models: Vec<String>) -> Self {
        self.models = Some(models);
        self
    }

    pub fn transformer(mut self, setting: TransformerSetting) -> Self {
        self.transformer = Some(setting);
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

/// One route table entry. Stored under both the bare model name and the
/// qualified `provider,model` key.
#[derive(Debug, Clone)]
struct ModelRoute {
    provider: String,
    model: String,
}

/// A resolved route: a live handle to the provider plus the model it should
/// be asked for. `original_model` and `target_model` only diverge once a
/// rewrite step renames models; today both carry the route's source model.
#[derive(Debug, Clone)]
pub struct RouteResolution {
    pub provider: Arc<Provider>,
    pub original_model: String,
    pub target_model: String,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

struct RegistryInner {
    providers: HashMap<String, Arc<Provider>>,
    /// Registration order; drives listing order and keeps provider priority
    /// explicit rather than leaning on map iteration order.
    order: Vec<String>,
    routes: HashMap<String, ModelRoute>,
}

/// Owns the provider set, one key selector per provider, and the derived
/// model route table.
pub struct ProviderRegistry {
    transformers: TransformerRegistry,
    inner: RwLock<RegistryInner>,
}

impl ProviderRegistry {
    /// Registry resolving transformer chains against the given adapter
    /// lookup.
    pub fn new(transformers: TransformerRegistry) -> Self {
        Self {
            transformers,
            inner: RwLock::new(RegistryInner {
                providers: HashMap::new(),
                order: Vec::new(),
                routes: HashMap::new(),
            }),
        }
    }

    // -- registration --------------------------------------------------------

    /// Validate and register one provider, replacing any provider already
    /// registered under the same name (last write wins, no merging).
    pub fn register_provider(
        &self,
        config: ProviderConfig,
    ) -> Result<Arc<Provider>, GatewayError> {
        validate_config(&config)?;
        let keys = config.api_key.to_vec();

        let (chain, model_chains) = self.resolve_chains(config.transformer.as_ref());
        let now = Utc::now();
        let provider = Arc::new(Provider {
            name: config.name.clone(),
            state: RwLock::new(ProviderState {
                base_url: config.api_base_url,
                models: config.models.clone(),
                key_strategy: config.api_key_strategy,
                selector: Arc::new(KeySelector::new(
                    config.name.clone(),
                    keys,
                    config.api_key_strategy,
                )),
                chain,
                model_chains,
                enabled: true,
                created_at: now,
                updated_at: now,
            }),
        });

        let mut inner = self.write_inner();
        if inner.providers.contains_key(&config.name) {
            warn!(provider = %config.name, "Provider already registered, replacing");
            remove_provider_entry(&mut inner, &config.name);
        }
        inner.order.push(config.name.clone());
        inner
            .providers
            .insert(config.name.clone(), Arc::clone(&provider));
        insert_routes(&mut inner, &config.name, &config.models);

        info!(
            provider = %config.name,
            models = config.models.len(),
            keys = provider.key_count(),
            strategy = ?provider.key_strategy(),
            "Registered provider"
        );
        Ok(provider)
    }

    /// Bulk-register a configuration set. A malformed entry is logged and
    /// skipped; it never prevents the remaining entries from loading.
    pub fn load_providers(&self, configs: Vec<ProviderConfig>) -> Vec<Arc<Provider>> {
        let mut loaded = Vec::with_capacity(configs.len());
        for config in configs {
            let name = config.name.clone();
            match self.register_provider(config) {
                Ok(provider) => loaded.push(provider),
                Err(err) => {
                    error!(provider = %name, error = %err, "Skipping provider");
                }
            }
        }
        loaded
    }

    /// Merge the populated fields of `update` over an existing provider.
    /// Returns `None` when the name is unknown (soft failure).
    pub fn update_provider(&self, name: &str, update: ProviderUpdate) -> Option<Arc<Provider>> {
        let mut inner = self.write_inner();
        let provider = Arc::clone(inner.providers.get(name)?);
        let models_changed = update.models.is_some();

        {
            let mut state = provider.write();

            if let Some(base_url) = update.api_base_url {
                state.base_url = base_url;
            }
            if let Some(enabled) = update.enabled {
                state.enabled = enabled;
            }
            if let Some(setting) = update.transformer.as_ref() {
                let (chain, model_chains) = self.resolve_chains(Some(setting));
                state.chain = chain;
                state.model_chains = model_chains;
            }

            // Credential edits rebuild the selector from scratch: in-flight
            // rotation state is deliberately discarded.
            if update.api_key.is_some() || update.api_key_strategy.is_some() {
                let keys = match update.api_key {
                    Some(keys) if keys.is_empty() => {
                        warn!(provider = %name, "Ignoring update with empty api_key list");
                        state.selector.keys().to_vec()
                    }
                    Some(keys) => keys,
                    None => state.selector.keys().to_vec(),
                };
                let strategy = update.api_key_strategy.unwrap_or(state.key_strategy);
                state.key_strategy = strategy;
                state.selector = Arc::new(KeySelector::new(name.to_string(), keys, strategy));
            }

            if let Some(models) = update.models {
                state.models = models;
            }

            state.updated_at = Utc::now();
        }

        // Only a model-list change touches the route table: the provider's
        // old routes go away and the new list claims what it can.
        if models_changed {
            let models = provider.models();
            inner.routes.retain(|_, route| route.provider != name);
            insert_routes(&mut inner, name, &models);
        }

        debug!(provider = %name, "Updated provider");
        Some(provider)
    }

    /// Remove a provider together with its selector and every route it owns.
    pub fn delete_provider(&self, name: &str) -> bool {
        let mut inner = self.write_inner();
        if !inner.providers.contains_key(name) {
            return false;
        }
        remove_provider_entry(&mut inner, name);
        info!(provider = %name, "Deleted provider");
        true
    }

    /// Enable or disable a provider without deleting it. Disabled providers
    /// are skipped by route resolution and model listing.
    pub fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        let inner = self.read_inner();
        let Some(provider) = inner.providers.get(name) else {
            return false;
        };
        let mut state = provider.write();
        state.enabled = enabled;
        state.updated_at = Utc::now();
        info!(provider = %name, enabled, "Toggled provider");
        true
    }

    // -- accessors -----------------------------------------------------------

    /// All providers in registration order.
    pub fn providers(&self) -> Vec<Arc<Provider>> {
        let inner = self.read_inner();
        inner
            .order
            .iter()
            .filter_map(|name| inner.providers.get(name).cloned())
            .collect()
    }

    pub fn provider(&self, name: &str) -> Option<Arc<Provider>> {
        self.read_inner().providers.get(name).cloned()
    }

    /// Delegate key selection to the named provider's selector.
    pub fn select_api_key(
        &self,
        provider_name: &str,
        exclude: Option<usize>,
    ) -> Result<SelectedKey, GatewayError> {
        self.provider(provider_name)
            .ok_or_else(|| GatewayError::UnknownProvider(provider_name.to_string()))?
            .select_key(exclude)
    }

    pub fn api_key_count(&self, provider_name: &str) -> Result<usize, GatewayError> {
        Ok(self
            .provider(provider_name)
            .ok_or_else(|| GatewayError::UnknownProvider(provider_name.to_string()))?
            .key_count())
    }

    // -- routing -------------------------------------------------------------

    /// Resolve a bare or qualified model name to its serving provider.
    ///
    /// Returns `None` for unknown names and for names served only by a
    /// disabled provider; retry/fallback policy stays with the caller.
    pub fn resolve_model_route(&self, name: &str) -> Option<RouteResolution> {
        let inner = self.read_inner();
        let route = inner.routes.get(name)?;
        // Routes are removed atomically with their provider; this guards
        // against a partially-applied mutation.
        let provider = inner.providers.get(&route.provider)?;
        if !provider.enabled() {
            debug!(model = name, provider = %route.provider, "Route hit disabled provider");
            return None;
        }
        Some(RouteResolution {
            provider: Arc::clone(provider),
            original_model: route.model.clone(),
            target_model: route.model.clone(),
        })
    }

    /// Every routable identifier in provider registration order then model
    /// order. Each model is listed under both its bare and qualified name,
    /// for every provider serving it; a shared bare name therefore appears
    /// once per serving provider even though only the first claimant routes
    /// it.
    pub fn model_names(&self) -> Vec<String> {
        let inner = self.read_inner();
        let mut names = Vec::new();
        for provider_name in &inner.order {
            let Some(provider) = inner.providers.get(provider_name) else {
                continue;
            };
            if !provider.enabled() {
                continue;
            }
            for model in provider.models() {
                names.push(model.clone());
                names.push(format!("{provider_name},{model}"));
            }
        }
        names
    }

    /// Model listing in the unified wire shape, same enumeration as
    /// [`ProviderRegistry::model_names`].
    pub fn model_list(&self) -> ModelList {
        let inner = self.read_inner();
        let mut data = Vec::new();
        for provider_name in &inner.order {
            let Some(provider) = inner.providers.get(provider_name) else {
                continue;
            };
            if !provider.enabled() {
                continue;
            }
            for model in provider.models() {
                data.push(model_info(model.clone(), provider_name));
                data.push(model_info(format!("{provider_name},{model}"), provider_name));
            }
        }
        ModelList {
            object: "list".to_string(),
            data,
        }
    }

    // -- internals -----------------------------------------------------------

    fn resolve_chains(
        &self,
        setting: Option<&TransformerSetting>,
    ) -> (TransformerChain, HashMap<String, TransformerChain>) {
        let Some(setting) = setting else {
            return (TransformerChain::empty(), HashMap::new());
        };
        let chain = self.transformers.resolve_chain(&setting.provider_chain);
        let model_chains = setting
            .model_chains
            .iter()
            .map(|(model, specs)| (model.clone(), self.transformers.resolve_chain(specs)))
            .collect();
        (chain, model_chains)
    }

    fn read_inner(&self) -> RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_inner(&self) -> RwLockWriteGuard<'_, RegistryInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ProviderRegistry {
    /// Registry with the built-in transformer set.
    fn default() -> Self {
        Self::new(TransformerRegistry::default())
    }
}

fn model_info(id: String, provider: &str) -> ModelInfo {
    ModelInfo {
        id,
        object: "model".to_string(),
        owned_by: provider.to_string(),
        provider: provider.to_string(),
    }
}

fn validate_config(config: &ProviderConfig) -> Result<(), GatewayError> {
    let invalid = |reason: &str| GatewayError::InvalidProviderConfig {
        name: config.name.clone(),
        reason: reason.to_string(),
    };
    if config.name.is_empty() {
        return Err(invalid("name must not be empty"));
    }
    if config.api_base_url.is_empty() {
        return Err(invalid("api_base_url must not be empty"));
    }
    if Url::parse(&config.api_base_url).is_err() {
        return Err(invalid("api_base_url is not a valid URL"));
    }
    if config.api_key.is_empty() {
        return Err(invalid("api_key must not be empty"));
    }
    Ok(())
}

/// Insert routes for a provider's model list: the qualified entry always
/// wins its own key; the bare entry is only written when vacant, so the
/// first provider to claim a bare name keeps it.
fn insert_routes(inner: &mut RegistryInner, provider: &str, models: &[String]) {
    for model in models {
        inner.routes.insert(
            format!("{provider},{model}"),
            ModelRoute {
                provider: provider.to_string(),
                model: model.clone(),
            },
        );
        inner.routes.entry(model.clone()).or_insert_with(|| ModelRoute {
            provider: provider.to_string(),
            model: model.clone(),
        });
    }
}

/// Drop a provider and every route it owns, leaving other providers' routes
/// untouched.
fn remove_provider_entry(inner: &mut RegistryInner, name: &str) {
    inner.providers.remove(name);
    inner.order.retain(|n| n != name);
    inner.routes.retain(|_, route| route.provider != name);
}
