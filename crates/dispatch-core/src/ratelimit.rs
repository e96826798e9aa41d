//! Sliding-window limiter with per-client and per-(provider, model) dimensions (§4.3).
//!
//! Grounded on `original_source/src/config/rate_limits/manager.py::RateLimitsManager`
//! for the tier registry and `calculate_time_estimate`/`suggest_optimal_settings`
//! shapes (SPEC_FULL §11); the sliding-window accounting itself is new since the
//! original enforces limits per-provider SDK rather than centrally.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

/// A named level of rate-limit capacity for a provider (§3 GLOSSARY, §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    Free,
    Tier1,
    Tier2,
    Tier3,
    Tier4,
    Scale,
}

impl std::str::FromStr for Tier {
    type Err = crate::error::DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "free" => Ok(Tier::Free),
            "tier1" => Ok(Tier::Tier1),
            "tier2" => Ok(Tier::Tier2),
            "tier3" => Ok(Tier::Tier3),
            "tier4" => Ok(Tier::Tier4),
            "scale" => Ok(Tier::Scale),
            other => Err(crate::error::DispatchError::Config(vec![format!(
                "unknown rate-limit tier: {other}"
            )])),
        }
    }
}

/// Caps for one (provider, tier) pair, optionally overridden per-model (§4.3).
#[derive(Debug, Clone, Copy)]
pub struct TierLimits {
    pub requests_per_minute: u64,
    pub tokens_per_minute: u64,
    pub requests_per_day: Option<u64>,
    pub tokens_per_day: Option<u64>,
    pub concurrent: u64,
}

/// Result of `acquire` (§4.3).
#[derive(Debug, Clone)]
pub struct AcquireResult {
    pub allowed: bool,
    pub minute_remaining: i64,
    pub hour_remaining: i64,
    pub reset_minute_at: SystemTime,
    pub reset_hour_at: SystemTime,
    pub retry_after: Option<Duration>,
}

/// Recommendation produced by `suggest_tier` (SPEC_FULL §11).
#[derive(Debug, Clone)]
pub struct TierSuggestion {
    pub tier: Tier,
    pub estimated_minutes: f64,
    pub meets_target: bool,
    pub warning: Option<String>,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    at: SystemTime,
    weight: u64,
}

#[derive(Default)]
struct Window {
    entries: Vec<Entry>,
}

impl Window {
    fn evict_older_than(&mut self, now: SystemTime, window: Duration) {
        self.entries.retain(|e| {
            now.duration_since(e.at).unwrap_or_default() < window
        });
    }

    fn sum(&self) -> u64 {
        self.entries.iter().map(|e| e.weight).sum()
    }

    fn oldest(&self) -> Option<SystemTime> {
        self.entries.iter().map(|e| e.at).min()
    }
}

struct ClientState {
    minute: Window,
    hour: Window,
}

/// Sliding-window rate limiter. One instance serves all clients and providers; internal
/// state is partitioned per `(client_id, provider, model)` behind a single mutex (§5:
/// "Rate Limiter (per-dimension mutex over the sliding-window structure)").
pub struct RateLimiter {
    state: Mutex<HashMap<String, ClientState>>,
    tiers: Mutex<HashMap<(String, Tier), TierLimits>>,
    current_tier: Mutex<HashMap<String, Tier>>,
}

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
            tiers: Mutex::new(HashMap::new()),
            current_tier: Mutex::new(HashMap::new()),
        }
    }

    pub fn register_tier(&self, provider: impl Into<String>, tier: Tier, limits: TierLimits) {
        self.tiers.lock().unwrap().insert((provider.into(), tier), limits);
    }

    pub fn set_tier(&self, provider: impl Into<String>, tier: Tier) {
        self.current_tier.lock().unwrap().insert(provider.into(), tier);
    }

    pub fn current_tier(&self, provider: &str) -> Option<Tier> {
        self.current_tier.lock().unwrap().get(provider).copied()
    }

    fn limits_for(&self, provider: &str) -> Result<TierLimits, crate::error::DispatchError> {
        let tier = self
            .current_tier(provider)
            .ok_or_else(|| crate::error::DispatchError::Config(vec![format!(
                "no rate-limit tier configured for provider {provider}"
            )]))?;
        self.tiers
            .lock()
            .unwrap()
            .get(&(provider.to_string(), tier))
            .copied()
            .ok_or_else(|| crate::error::DispatchError::Config(vec![format!(
                "unknown tier {tier:?} for provider {provider}"
            )]))
    }

    /// Records an acquisition key scoped to one client. Each client key tracks its own
    /// sliding windows independently of every other client (§4.3).
    fn key(client_id: &str, provider: &str) -> String {
        format!("{client_id}::{provider}")
    }

    /// `acquire(client_id, tokens_needed) -> AcquireResult` (§4.3). On `allowed=true`
    /// records the acquisition at `now`; on `allowed=false` records nothing.
    pub fn acquire(
        &self,
        client_id: &str,
        provider: &str,
        tokens_needed: u64,
    ) -> Result<AcquireResult, crate::error::DispatchError> {
        let limits = self.limits_for(provider)?;
        let now = SystemTime::now();
        let key = Self::key(client_id, provider);
        let mut state = self.state.lock().unwrap();
        let client = state.entry(key).or_insert_with(|| ClientState {
            minute: Window::default(),
            hour: Window::default(),
        });
        client.minute.evict_older_than(now, MINUTE);
        client.hour.evict_older_than(now, HOUR);

        let minute_used = client.minute.sum();
        let hour_used = client.hour.sum();
        let minute_cap = limits.tokens_per_minute;
        let hour_cap = limits.tokens_per_day.unwrap_or(u64::MAX);

        let would_exceed_minute = minute_used + tokens_needed > minute_cap;
        let would_exceed_hour = hour_used + tokens_needed > hour_cap;
        let would_exceed_request_rate = client.minute.entries.len() as u64 >= limits.requests_per_minute;

        let allowed = !would_exceed_minute && !would_exceed_hour && !would_exceed_request_rate;

        let retry_after = if allowed {
            None
        } else {
            let oldest = client.minute.oldest().or_else(|| client.hour.oldest());
            oldest.map(|oldest_at| {
                let window = if would_exceed_hour { HOUR } else { MINUTE };
                let expiry = oldest_at + window;
                expiry.duration_since(now).unwrap_or_default()
            })
        };

        if allowed {
            client.minute.entries.push(Entry { at: now, weight: tokens_needed });
            client.hour.entries.push(Entry { at: now, weight: tokens_needed });
        }

        Ok(AcquireResult {
            allowed,
            minute_remaining: minute_cap as i64 - minute_used as i64 - if allowed { tokens_needed as i64 } else { 0 },
            hour_remaining: hour_cap as i64 - hour_used as i64 - if allowed { tokens_needed as i64 } else { 0 },
            reset_minute_at: now + MINUTE,
            reset_hour_at: now + HOUR,
            retry_after,
        })
    }

    /// Estimated wall-clock time to push `total_tokens` across `queries` requests
    /// through a tier's rpm/tpm caps (SPEC_FULL §11).
    pub fn estimate_completion(
        &self,
        provider: &str,
        tier: Tier,
        total_tokens: u64,
        queries: u64,
    ) -> Option<Duration> {
        let limits = self.tiers.lock().unwrap().get(&(provider.to_string(), tier)).copied()?;
        let minutes_by_tokens = total_tokens as f64 / limits.tokens_per_minute.max(1) as f64;
        let minutes_by_requests = queries as f64 / limits.requests_per_minute.max(1) as f64;
        Some(Duration::from_secs_f64(minutes_by_tokens.max(minutes_by_requests) * 60.0))
    }

    /// Cheapest tier meeting `desired_minutes`, else the highest tier with a warning
    /// (`rate_limits/manager.py::suggest_optimal_settings`, SPEC_FULL §11).
    pub fn suggest_tier(
        &self,
        provider: &str,
        file_kb: f64,
        desired_minutes: f64,
    ) -> Option<TierSuggestion> {
        const ORDER: [Tier; 6] = [Tier::Free, Tier::Tier1, Tier::Tier2, Tier::Tier3, Tier::Tier4, Tier::Scale];
        let estimated_tokens = (file_kb * 1024.0 * 0.8) as u64;
        let queries = 1;
        let tiers = self.tiers.lock().unwrap();
        let mut last = None;
        for tier in ORDER {
            if let Some(limits) = tiers.get(&(provider.to_string(), tier)) {
                let minutes_by_tokens = estimated_tokens as f64 / limits.tokens_per_minute.max(1) as f64;
                let minutes_by_requests = queries as f64 / limits.requests_per_minute.max(1) as f64;
                let estimated_minutes = minutes_by_tokens.max(minutes_by_requests);
                if estimated_minutes <= desired_minutes {
                    return Some(TierSuggestion {
                        tier,
                        estimated_minutes,
                        meets_target: true,
                        warning: None,
                    });
                }
                last = Some((tier, estimated_minutes));
            }
        }
        last.map(|(tier, estimated_minutes)| TierSuggestion {
            tier,
            estimated_minutes,
            meets_target: false,
            warning: Some(format!(
                "no tier for {provider} meets the {desired_minutes:.1} minute target; highest available tier estimated at {estimated_minutes:.1} minutes"
            )),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter_with_tier1() -> RateLimiter {
        let limiter = RateLimiter::new();
        limiter.register_tier(
            "anthropic",
            Tier::Tier1,
            TierLimits {
                requests_per_minute: 1,
                tokens_per_minute: 100,
                requests_per_day: None,
                tokens_per_day: None,
                concurrent: 1,
            },
        );
        limiter.set_tier("anthropic", Tier::Tier1);
        limiter
    }

    #[test]
    fn acquire_succeeds_then_denies_within_window() {
        let limiter = limiter_with_tier1();
        let first = limiter.acquire("client-x", "anthropic", 10).unwrap();
        assert!(first.allowed);
        let second = limiter.acquire("client-x", "anthropic", 10).unwrap();
        assert!(!second.allowed);
        assert!(second.retry_after.unwrap() <= Duration::from_secs(60));
    }

    #[test]
    fn distinct_clients_do_not_share_budget() {
        let limiter = limiter_with_tier1();
        assert!(limiter.acquire("a", "anthropic", 10).unwrap().allowed);
        assert!(limiter.acquire("b", "anthropic", 10).unwrap().allowed);
    }

    #[test]
    fn unknown_tier_fails_explicitly() {
        let limiter = RateLimiter::new();
        let result = limiter.acquire("a", "anthropic", 1);
        assert!(result.is_err());
    }

    #[test]
    fn suggest_tier_recommends_cheapest_meeting_target() {
        let limiter = RateLimiter::new();
        limiter.register_tier(
            "anthropic",
            Tier::Free,
            TierLimits { requests_per_minute: 1, tokens_per_minute: 1000, requests_per_day: None, tokens_per_day: None, concurrent: 1 },
        );
        limiter.register_tier(
            "anthropic",
            Tier::Tier1,
            TierLimits { requests_per_minute: 100, tokens_per_minute: 1_000_000, requests_per_day: None, tokens_per_day: None, concurrent: 10 },
        );
        let suggestion = limiter.suggest_tier("anthropic", 1.0, 5.0).unwrap();
        assert!(suggestion.meets_target);
        assert_eq!(suggestion.tier, Tier::Free);
    }
}
