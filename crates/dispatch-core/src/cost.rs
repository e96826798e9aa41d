//! Pure, side-effect-free pricing over a static model catalog (§4.2).
//!
//! Grounded on `original_source/src/utils/cost_calculator.py::CostCalculator`, but fixes
//! a bug in the original: there, `output_ratio` is computed per-mode but then discarded —
//! `output_tokens` is always `input_tokens * 0.4` regardless of mode. This implementation
//! honors the per-mode ratio from §4.2/`Mode::output_ratio` as specified.

use crate::model::{Mode, ModelCatalog, ModelSpec};

/// chars-per-token ratio used by `estimate_tokens`, keyed by provider family (§4.2).
pub fn chars_per_token(provider: &str) -> f64 {
    match provider.to_ascii_lowercase().as_str() {
        "anthropic" => 2.5,
        "openai" => 4.0,
        _ => 3.5,
    }
}

/// `(input_tokens, output_tokens)` for `bytes` of content against `provider`'s ratio and
/// `mode`'s output ratio (§4.2).
pub fn estimate_tokens(bytes: u64, provider: &str, mode: Mode) -> (u64, u64) {
    let ratio = chars_per_token(provider);
    let input_tokens = (bytes as f64 / ratio).round() as u64;
    let output_tokens = (input_tokens as f64 * mode.output_ratio()).round() as u64;
    (input_tokens, output_tokens)
}

/// `(in/1000)*in_price + (out/1000)*out_price` (§4.2).
pub fn cost(spec: &ModelSpec, input_tokens: u64, output_tokens: u64) -> f64 {
    (input_tokens as f64 / 1000.0) * spec.input_cost_per_1k
        + (output_tokens as f64 / 1000.0) * spec.output_cost_per_1k
}

/// `ceil(input_tokens / (context_window * mode_ratio))` (§4.2).
pub fn chunks_needed(input_tokens: u64, spec: &ModelSpec, mode: Mode) -> u64 {
    let budget = (spec.context_window as f64 * mode.context_ratio()).max(1.0);
    ((input_tokens as f64) / budget).ceil().max(1.0) as u64
}

/// `analysis_time_estimate` (SPEC_FULL §11, `cost_calculator.py::calculate_cost`):
/// `base_time_minutes = file_kb / 100`, scaled by `(6 - speed_rating)`.
pub fn estimated_time_minutes(file_kb: f64, spec: &ModelSpec) -> f64 {
    let base = file_kb / 100.0;
    base * (6.0 - spec.speed_rating as f64).max(1.0)
}

/// One row of `compare`'s output (§4.2).
#[derive(Debug, Clone)]
pub struct Estimate {
    pub provider: String,
    pub model: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost: f64,
    pub est_time_minutes: f64,
    pub chunks_needed: u64,
    pub within_budget: bool,
    pub warnings: Vec<String>,
}

/// Preference used to break ties in `recommend` (§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preference {
    Quality,
    Speed,
}

/// Pure pricing calculator over a set of provider catalogs. Holds no mutable state;
/// safe to share across dispatches without synchronization.
#[derive(Debug, Clone, Default)]
pub struct CostCalculator {
    catalogs: Vec<(String, ModelCatalog)>,
}

impl CostCalculator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_catalog(&mut self, provider: impl Into<String>, catalog: ModelCatalog) {
        self.catalogs.push((provider.into(), catalog));
    }

    /// `compare(file_kb, mode, budget) -> [Estimate]` sorted ascending by total cost (§4.2).
    pub fn compare(&self, file_kb: f64, mode: Mode, budget: Option<f64>) -> Vec<Estimate> {
        let bytes = (file_kb * 1024.0) as u64;
        let mut estimates: Vec<Estimate> = self
            .catalogs
            .iter()
            .flat_map(|(provider, catalog)| {
                catalog.iter().map(move |(model, spec)| (provider, model, spec))
            })
            .map(|(provider, model, spec)| {
                let (tokens_in, tokens_out) = estimate_tokens(bytes, provider, mode);
                let total_cost = cost(spec, tokens_in, tokens_out);
                let mut warnings = Vec::new();
                if tokens_in > spec.context_window {
                    warnings.push(format!(
                        "estimated input ({tokens_in} tokens) exceeds {model}'s context window ({})",
                        spec.context_window
                    ));
                }
                let within_budget = budget.map(|b| total_cost <= b).unwrap_or(true);
                Estimate {
                    provider: provider.clone(),
                    model: model.clone(),
                    tokens_in,
                    tokens_out,
                    cost: total_cost,
                    est_time_minutes: estimated_time_minutes(file_kb, spec),
                    chunks_needed: chunks_needed(tokens_in, spec, mode),
                    within_budget,
                    warnings,
                }
            })
            .collect();
        estimates.sort_by(|a, b| a.cost.partial_cmp(&b.cost).unwrap_or(std::cmp::Ordering::Equal));
        estimates
    }

    /// Cheapest within-budget model, or the cheapest overall if none fit; ties broken by
    /// `quality_rating` (Quality preference) or `speed_rating` (Speed preference) (§4.2).
    pub fn recommend(
        &self,
        file_kb: f64,
        mode: Mode,
        budget: Option<f64>,
        prefer: Preference,
    ) -> Option<String> {
        let mut estimates = self.compare(file_kb, mode, budget);
        if estimates.is_empty() {
            return None;
        }
        let within: Vec<&Estimate> = estimates.iter().filter(|e| e.within_budget).collect();
        let pool: Vec<&Estimate> = if within.is_empty() {
            estimates.iter().collect()
        } else {
            within
        };
        let min_cost = pool
            .iter()
            .map(|e| e.cost)
            .fold(f64::INFINITY, f64::min);
        let tied: Vec<&Estimate> = pool
            .into_iter()
            .filter(|e| (e.cost - min_cost).abs() < 1e-9)
            .collect();
        let winner = tied.into_iter().max_by(|a, b| {
            let spec_of = |e: &Estimate| {
                self.catalogs
                    .iter()
                    .find(|(p, _)| p == &e.provider)
                    .and_then(|(_, c)| c.get(&e.model))
            };
            let rating = |e: &&Estimate| match prefer {
                Preference::Quality => spec_of(e).map(|s| s.quality_rating).unwrap_or(0),
                Preference::Speed => spec_of(e).map(|s| s.speed_rating).unwrap_or(0),
            };
            rating(a).cmp(&rating(b))
        })?;
        estimates.retain(|e| e.model == winner.model && e.provider == winner.provider);
        Some(winner.model.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn anthropic_catalog() -> ModelCatalog {
        let mut catalog = HashMap::new();
        catalog.insert(
            "claude-3-5-sonnet".to_string(),
            ModelSpec {
                input_cost_per_1k: 3.0,
                output_cost_per_1k: 15.0,
                context_window: 200_000,
                max_output_tokens: 8192,
                speed_rating: 3,
                quality_rating: 5,
            },
        );
        catalog.insert(
            "claude-3-5-haiku".to_string(),
            ModelSpec {
                input_cost_per_1k: 0.8,
                output_cost_per_1k: 4.0,
                context_window: 200_000,
                max_output_tokens: 8192,
                speed_rating: 5,
                quality_rating: 3,
            },
        );
        catalog
    }

    #[test]
    fn estimate_tokens_matches_spec_example() {
        // §8 scenario 6: 100 KB, Intelligent mode, Anthropic.
        let bytes = 100 * 1024;
        let (input, output) = estimate_tokens(bytes, "anthropic", Mode::Intelligent);
        assert!((input as f64 - 40_960.0).abs() / 40_960.0 < 0.01);
        assert!((output as f64 - (input as f64 * 0.4)).abs() < 1.0);
    }

    #[test]
    fn cost_matches_spec_example() {
        let spec = ModelSpec {
            input_cost_per_1k: 3.0,
            output_cost_per_1k: 15.0,
            context_window: 200_000,
            max_output_tokens: 8192,
            speed_rating: 3,
            quality_rating: 5,
        };
        let total = cost(&spec, 40_960, 16_384);
        assert!((total - 3.6864).abs() / 3.6864 < 0.01);
    }

    #[test]
    fn compare_sorts_ascending_by_cost() {
        let mut calc = CostCalculator::new();
        calc.register_catalog("anthropic", anthropic_catalog());
        let estimates = calc.compare(50.0, Mode::Quick, None);
        assert_eq!(estimates.len(), 2);
        assert!(estimates[0].cost <= estimates[1].cost);
    }

    #[test]
    fn recommend_picks_cheapest_within_budget() {
        let mut calc = CostCalculator::new();
        calc.register_catalog("anthropic", anthropic_catalog());
        let recommendation = calc.recommend(50.0, Mode::Quick, Some(1.0), Preference::Quality);
        assert_eq!(recommendation.as_deref(), Some("claude-3-5-haiku"));
    }

    #[test]
    fn recommend_falls_back_to_cheapest_overall_when_nothing_fits_budget() {
        let mut calc = CostCalculator::new();
        calc.register_catalog("anthropic", anthropic_catalog());
        let recommendation = calc.recommend(50.0, Mode::Quick, Some(0.0001), Preference::Speed);
        assert!(recommendation.is_some());
    }
}
