//! Wires one `DispatchConfig` into a runnable [`dispatch_core::engine::DispatchEngine`]
//! plus the supporting registries, the way `crates/cli/src/provider.rs` turns `CliArgs`
//! into a built `querymt` provider.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use dispatch_core::audit::AuditStore;
use dispatch_core::cache::Cache;
use dispatch_core::cancel::CancellationManager;
use dispatch_core::config::DispatchConfig;
use dispatch_core::cost::CostCalculator;
use dispatch_core::engine::DispatchEngine;
use dispatch_core::provider::{ProviderAdapter, ProviderRegistry};
use dispatch_core::ratelimit::{RateLimiter, Tier, TierLimits};

pub struct Runtime {
    pub config: DispatchConfig,
    pub engine: Arc<DispatchEngine>,
    pub providers: Arc<ProviderRegistry>,
    pub cost_calculator: Arc<CostCalculator>,
    pub audit: Arc<dyn AuditStore>,
    pub cancellation: Arc<CancellationManager>,
}

pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".dispatch")
        .join("config.toml")
}

fn build_provider(name: &str, api_key: &str) -> Option<Arc<dyn ProviderAdapter>> {
    match name {
        "anthropic" => Some(Arc::new(dispatch_providers_anthropic::AnthropicAdapter::new(api_key))),
        "openai" => Some(Arc::new(dispatch_providers_openai::OpenAIAdapter::new(api_key))),
        _ => None,
    }
}

impl Runtime {
    /// Loads config from `path` (or the built-in default), registers every enabled
    /// provider with a resolvable API key, and assembles the engine (SPEC_FULL §12).
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map(PathBuf::from).unwrap_or_else(default_config_path);
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config at {}", path.display()))?;
        let config = DispatchConfig::from_toml(&raw)?;
        config.validate().context("config failed validation")?;
        Self::from_config(config).await
    }

    pub async fn from_config(config: DispatchConfig) -> Result<Self> {
        let mut registry = ProviderRegistry::new();
        let mut cost_calculator = CostCalculator::new();
        let rate_limiter = Arc::new(RateLimiter::new());

        let mut catalogs = std::collections::HashMap::new();
        for (name, settings) in &config.providers {
            if !settings.enabled {
                continue;
            }
            let api_key = config.api_keys.get(name).cloned().unwrap_or_default();
            let Some(adapter) = build_provider(name, &api_key) else {
                tracing::warn!(provider = name, "no adapter implementation for configured provider, skipping");
                continue;
            };
            catalogs.insert(name.clone(), adapter.models());
            cost_calculator.register_catalog(name.clone(), adapter.models());
            registry.register(adapter);
        }
        config.validate_mode_maps(&catalogs)?;

        for (provider, tiers) in &config.rate_limits {
            for (tier_name, limits) in tiers {
                let tier: Tier = tier_name.parse().map_err(|e| anyhow::anyhow!("{e}"))?;
                rate_limiter.register_tier(
                    provider,
                    tier,
                    TierLimits {
                        requests_per_minute: limits.rpm,
                        tokens_per_minute: limits.tpm,
                        requests_per_day: limits.rpd,
                        tokens_per_day: limits.tpd,
                        concurrent: limits.concurrent,
                    },
                );
                rate_limiter.set_tier(provider, tier);
            }
        }

        let cache = Arc::new(Cache::new(
            config.cache.hot_capacity,
            std::time::Duration::from_secs(config.cache.ttl_hours * 3600),
            config.cache.enabled.then(|| config.cache.dir.clone()),
        ));

        std::fs::create_dir_all(&config.cache.dir).ok();
        let db_path = config.cache.dir.join("audit.sqlite3");
        let audit: Arc<dyn AuditStore> = Arc::new(
            dispatch_core::audit::SqliteAuditStore::new(&format!("sqlite://{}?mode=rwc", db_path.display()))
                .await
                .context("opening audit store")?,
        );

        let cancellation = Arc::new(CancellationManager::new());
        let cost_calculator = Arc::new(cost_calculator);
        let providers = Arc::new(registry);

        let engine = Arc::new(DispatchEngine::new(
            providers.clone(),
            cache,
            rate_limiter,
            cost_calculator.clone(),
            audit.clone(),
            cancellation.clone(),
            Some(config.default_provider.clone()),
            std::time::Duration::from_secs(config.request_timeout_seconds),
        ));

        Ok(Self {
            config,
            engine,
            providers,
            cost_calculator,
            audit,
            cancellation,
        })
    }
}
