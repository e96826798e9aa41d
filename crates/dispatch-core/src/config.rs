//! Process configuration (§6, SPEC_FULL §10.3).
//!
//! Deserialized from TOML the way the teacher's CLI loads its own config
//! (`toml`, with config *path* resolution via `dirs` kept in `dispatch-cli`,
//! see `crates/cli/src/*`). `DispatchConfig::validate` collects every problem
//! before returning rather than failing on the first one found (§6 "Invalid
//! or contradictory config causes startup failure with a human-readable
//! diagnostic listing every problem").

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::DispatchError;
use crate::model::{Mode, ModeMap};
use crate::ratelimit::Tier;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: u64,
    #[serde(default = "default_hot_capacity")]
    pub hot_capacity: usize,
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,
}

fn default_true() -> bool {
    true
}
fn default_ttl_hours() -> u64 {
    24
}
fn default_hot_capacity() -> usize {
    256
}
fn default_cache_dir() -> PathBuf {
    PathBuf::from("./cache")
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            ttl_hours: default_ttl_hours(),
            hot_capacity: default_hot_capacity(),
            dir: default_cache_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ProviderSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub fallback: Option<String>,
}

/// One (provider, tier) -> caps row, flattened from the `rate_limits.<provider>.<tier>`
/// config table (§6).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    pub rpm: u64,
    pub tpm: u64,
    pub rpd: Option<u64>,
    pub tpd: Option<u64>,
    #[serde(default = "default_concurrent")]
    pub concurrent: u64,
}

fn default_concurrent() -> u64 {
    1
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    pub dir: Option<PathBuf>,
    #[serde(default = "default_log_max_bytes")]
    pub max_bytes: u64,
    #[serde(default = "default_log_backups")]
    pub backups: u32,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_max_bytes() -> u64 {
    10 * 1024 * 1024
}
fn default_log_backups() -> u32 {
    5
}
fn default_log_format() -> LogFormat {
    LogFormat::Compact
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

/// Every behavioral knob enumerated in §6. Deserialized from TOML; `api_keys` values may
/// use `${VAR}` interpolation resolved from the process environment at load time and are
/// never logged.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DispatchConfig {
    pub max_file_size_bytes: u64,
    pub max_concurrent_analyses: usize,
    pub max_queue_size: usize,
    #[serde(default)]
    pub cache: CacheConfig,
    /// `provider -> tier -> limits`.
    #[serde(default)]
    pub rate_limits: HashMap<String, HashMap<String, RateLimitConfig>>,
    #[serde(default)]
    pub providers: HashMap<String, ProviderSettings>,
    pub default_provider: String,
    #[serde(default = "default_mode")]
    pub default_mode: Mode,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// `provider -> credential`. Resolved from `${VAR}` env interpolation by
    /// [`DispatchConfig::load`]; a provider with no resolvable key is disabled at startup.
    #[serde(default)]
    pub api_keys: HashMap<String, String>,
    /// `provider -> mode -> model-id`, checked against each provider's `ModelCatalog` by
    /// [`DispatchConfig::validate_mode_maps`] once adapters are registered.
    #[serde(default)]
    pub mode_maps: HashMap<String, ModeMap>,
}

fn default_mode() -> Mode {
    Mode::Intelligent
}
fn default_request_timeout() -> u64 {
    300
}

impl DispatchConfig {
    /// Parses TOML and resolves `${VAR}` interpolation in `api_keys` against the process
    /// environment (§6 "absent -> provider disabled at startup").
    pub fn from_toml(raw: &str) -> Result<Self, DispatchError> {
        let mut config: DispatchConfig =
            toml::from_str(raw).map_err(|e| DispatchError::Config(vec![e.to_string()]))?;
        for value in config.api_keys.values_mut() {
            if let Some(var) = value
                .strip_prefix("${")
                .and_then(|s| s.strip_suffix('}'))
            {
                *value = std::env::var(var).unwrap_or_default();
            }
        }
        Ok(config)
    }

    /// Collects every structural problem before returning, per §6.
    pub fn validate(&self) -> Result<(), DispatchError> {
        let mut problems = Vec::new();

        if self.max_file_size_bytes == 0 {
            problems.push("max_file_size_bytes must be > 0".to_string());
        }
        if self.max_concurrent_analyses == 0 {
            problems.push("max_concurrent_analyses must be > 0".to_string());
        }
        if self.max_queue_size == 0 {
            problems.push("max_queue_size must be > 0".to_string());
        }
        if self.request_timeout_seconds == 0 {
            problems.push("request_timeout_seconds must be > 0".to_string());
        }
        if self.cache.hot_capacity == 0 && self.cache.enabled {
            problems.push("cache.hot_capacity must be > 0 when cache.enabled".to_string());
        }

        if !self.providers.contains_key(&self.default_provider) {
            problems.push(format!(
                "default_provider '{}' is not present in [providers]",
                self.default_provider
            ));
        } else if !self.providers[&self.default_provider].enabled {
            problems.push(format!(
                "default_provider '{}' is configured but not enabled",
                self.default_provider
            ));
        }

        for (provider, tiers) in &self.rate_limits {
            for (tier_name, limits) in tiers {
                if let Err(e) = tier_name.parse::<Tier>() {
                    problems.push(format!("rate_limits.{provider}.{tier_name}: {e}"));
                }
                if limits.rpm == 0 {
                    problems.push(format!("rate_limits.{provider}.{tier_name}.rpm must be > 0"));
                }
                if limits.tpm == 0 {
                    problems.push(format!("rate_limits.{provider}.{tier_name}.tpm must be > 0"));
                }
            }
        }

        for (provider, fallback) in self
            .providers
            .iter()
            .filter_map(|(name, settings)| settings.fallback.as_ref().map(|f| (name, f)))
        {
            if !self.providers.contains_key(fallback) {
                problems.push(format!(
                    "providers.{provider}.fallback '{fallback}' is not a configured provider"
                ));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(DispatchError::Config(problems))
        }
    }

    /// Checks `ModeMap(m) ∈ ModelCatalog` for every configured provider against the
    /// catalogs actually registered at startup (§3 invariant). Run once adapters are
    /// wired, separately from the purely-structural `validate`.
    pub fn validate_mode_maps(
        &self,
        catalogs: &HashMap<String, crate::model::ModelCatalog>,
    ) -> Result<(), DispatchError> {
        let mut problems = Vec::new();
        for (provider, mode_map) in &self.mode_maps {
            let Some(catalog) = catalogs.get(provider) else {
                problems.push(format!("mode_maps has entries for unknown provider '{provider}'"));
                continue;
            };
            for mode in [Mode::Quick, Mode::Intelligent, Mode::LargeFile, Mode::MaxToken] {
                if let Some(model) = mode_map.get(&mode) {
                    if !catalog.contains_key(model) {
                        problems.push(format!(
                            "mode_maps.{provider}.{mode:?} points to model '{model}' which is not in its ModelCatalog"
                        ));
                    }
                }
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(DispatchError::Config(problems))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> String {
        r#"
max_file_size_bytes = 10485760
max_concurrent_analyses = 4
max_queue_size = 100
default_provider = "anthropic"
default_mode = "intelligent"

[providers.anthropic]
enabled = true
priority = 1
"#
        .to_string()
    }

    #[test]
    fn minimal_config_parses_and_validates() {
        let config = DispatchConfig::from_toml(&minimal_toml()).unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn missing_default_provider_collects_as_a_problem() {
        let mut config = DispatchConfig::from_toml(&minimal_toml()).unwrap();
        config.default_provider = "nonexistent".to_string();
        let err = config.validate().unwrap_err();
        match err {
            DispatchError::Config(problems) => {
                assert!(problems.iter().any(|p| p.contains("nonexistent")));
            }
            other => panic!("expected Config error, got {other:?}"),
        }
    }

    #[test]
    fn validate_collects_multiple_problems_at_once() {
        let mut config = DispatchConfig::from_toml(&minimal_toml()).unwrap();
        config.max_file_size_bytes = 0;
        config.max_queue_size = 0;
        config.default_provider = "missing".to_string();
        let err = config.validate().unwrap_err();
        match err {
            DispatchError::Config(problems) => assert!(problems.len() >= 3),
            other => panic!("expected Config error, got {other:?}"),
        }
    }

    #[test]
    fn api_key_env_interpolation_resolves_from_environment() {
        std::env::set_var("DISPATCH_TEST_KEY", "secret-value");
        let mut toml = minimal_toml();
        toml.push_str("\n[api_keys]\nanthropic = \"${DISPATCH_TEST_KEY}\"\n");
        let config = DispatchConfig::from_toml(&toml).unwrap();
        assert_eq!(config.api_keys["anthropic"], "secret-value");
        std::env::remove_var("DISPATCH_TEST_KEY");
    }

    #[test]
    fn mode_map_pointing_at_missing_model_is_a_problem() {
        let mut config = DispatchConfig::from_toml(&minimal_toml()).unwrap();
        let mut mode_map = ModeMap::new();
        mode_map.insert(Mode::Quick, "ghost-model".to_string());
        config.mode_maps.insert("anthropic".to_string(), mode_map);
        let mut catalogs = HashMap::new();
        catalogs.insert("anthropic".to_string(), crate::model::ModelCatalog::new());
        let err = config.validate_mode_maps(&catalogs).unwrap_err();
        match err {
            DispatchError::Config(problems) => assert!(problems.iter().any(|p| p.contains("ghost-model"))),
            other => panic!("expected Config error, got {other:?}"),
        }
    }
}
