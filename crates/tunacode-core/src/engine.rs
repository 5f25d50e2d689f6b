// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use tracing::debug;
use tunacode_config::Settings;
use tunacode_model::ModelProvider;

/// Builds a provider for a model name.  Concrete transports are wired in by
/// the front-end; tests install a factory returning scripted mocks.
pub type ProviderFactory =
    Arc<dyn Fn(&str, &Settings) -> anyhow::Result<Arc<dyn ModelProvider>> + Send + Sync>;

struct CachedProvider {
    provider: Arc<dyn ModelProvider>,
    settings_hash: u64,
}

/// Owns the per-process provider cache, keyed by model name and settings.
///
/// A cached client can hold poisoned HTTP state after a timeout or abort, so
/// the orchestrator invalidates the entry in both cases; the next turn
/// rebuilds from the factory.
pub struct Engine {
    factory: ProviderFactory,
    cache: Mutex<HashMap<String, CachedProvider>>,
}

impl Engine {
    pub fn new(
        factory: impl Fn(&str, &Settings) -> anyhow::Result<Arc<dyn ModelProvider>>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            factory: Arc::new(factory),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Engine that always serves the given provider.  Test convenience.
    pub fn with_provider(provider: Arc<dyn ModelProvider>) -> Self {
        Self::new(move |_, _| Ok(Arc::clone(&provider)))
    }

    /// Cached provider for `model`, rebuilt when absent or when the settings
    /// changed since it was created.
    pub fn get_or_create(
        &self,
        model: &str,
        settings: &Settings,
    ) -> anyhow::Result<Arc<dyn ModelProvider>> {
        let settings_hash = hash_settings(settings);
        let mut cache = self.cache.lock().unwrap();
        if let Some(entry) = cache.get(model) {
            if entry.settings_hash == settings_hash {
                return Ok(Arc::clone(&entry.provider));
            }
            debug!(model, "settings changed; rebuilding cached provider");
        }
        let provider = (self.factory)(model, settings)?;
        cache.insert(
            model.to_string(),
            CachedProvider {
                provider: Arc::clone(&provider),
                settings_hash,
            },
        );
        Ok(provider)
    }

    /// Drop the cached provider for `model`.  Returns whether an entry existed.
    pub fn invalidate(&self, model: &str) -> bool {
        let removed = self.cache.lock().unwrap().remove(model).is_some();
        if removed {
            debug!(model, "provider cache invalidated");
        }
        removed
    }
}

fn hash_settings(settings: &Settings) -> u64 {
    // Settings is plain data; its JSON form is a stable hashing surface.
    let json = serde_json::to_string(settings).unwrap_or_default();
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    json.hash(&mut hasher);
    hasher.finish()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
