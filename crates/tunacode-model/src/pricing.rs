// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Static per-model pricing used for session cost accounting.
//!
//! Prices are USD per million tokens.  The table is deliberately small and
//! name-based: an unknown model simply produces a cost of zero rather than an
//! error, because cost display is advisory and must never block a turn.

/// USD per million tokens for one model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    pub input: f64,
    /// Discounted rate for prompt tokens served from the provider cache.
    pub cached_input: f64,
    pub output: f64,
}

const MILLION: f64 = 1_000_000.0;

/// Look up pricing by model name.
///
/// Accepts both bare model names and `provider:model` identifiers; matching
/// is prefix-based so that dated snapshots (`gpt-4.1-2025-04-14`) resolve to
/// their base entry.
pub fn get_model_pricing(model_name: &str) -> Option<ModelPricing> {
    let name = model_name
        .rsplit_once(':')
        .map(|(_, m)| m)
        .unwrap_or(model_name);

    // Ordered longest-prefix-first so e.g. "gpt-4.1-mini" does not fall
    // through to the "gpt-4.1" entry.
    const TABLE: &[(&str, ModelPricing)] = &[
        ("gpt-4.1-mini", ModelPricing { input: 0.40, cached_input: 0.10, output: 1.60 }),
        ("gpt-4.1", ModelPricing { input: 2.00, cached_input: 0.50, output: 8.00 }),
        ("gpt-4o-mini", ModelPricing { input: 0.15, cached_input: 0.075, output: 0.60 }),
        ("gpt-4o", ModelPricing { input: 2.50, cached_input: 1.25, output: 10.00 }),
        ("o4-mini", ModelPricing { input: 1.10, cached_input: 0.275, output: 4.40 }),
        ("claude-opus-4", ModelPricing { input: 15.00, cached_input: 1.50, output: 75.00 }),
        ("claude-sonnet-4", ModelPricing { input: 3.00, cached_input: 0.30, output: 15.00 }),
        ("claude-3-5-haiku", ModelPricing { input: 0.80, cached_input: 0.08, output: 4.00 }),
        ("gemini-2.5-pro", ModelPricing { input: 1.25, cached_input: 0.31, output: 10.00 }),
        ("gemini-2.5-flash", ModelPricing { input: 0.30, cached_input: 0.075, output: 2.50 }),
        ("deepseek-chat", ModelPricing { input: 0.27, cached_input: 0.07, output: 1.10 }),
    ];

    TABLE
        .iter()
        .find(|(prefix, _)| name.starts_with(prefix))
        .map(|(_, p)| *p)
}

/// Cost in USD for one call.  `non_cached_input` and `cached_input` are the
/// split of the prompt tokens; `output` is the completion token count.
pub fn calculate_cost(
    pricing: &ModelPricing,
    non_cached_input: u64,
    cached_input: u64,
    output: u64,
) -> f64 {
    (non_cached_input as f64 * pricing.input
        + cached_input as f64 * pricing.cached_input
        + output as f64 * pricing.output)
        / MILLION
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_model_has_no_pricing() {
        assert!(get_model_pricing("mystery-model-9000").is_none());
    }

    #[test]
    fn provider_prefix_is_stripped() {
        assert!(get_model_pricing("openai:gpt-4o").is_some());
        assert!(get_model_pricing("gpt-4o").is_some());
    }

    #[test]
    fn dated_snapshot_resolves_to_base_entry() {
        let base = get_model_pricing("gpt-4.1").unwrap();
        let dated = get_model_pricing("gpt-4.1-2025-04-14").unwrap();
        assert_eq!(base, dated);
    }

    #[test]
    fn mini_does_not_match_base_model() {
        let mini = get_model_pricing("gpt-4.1-mini").unwrap();
        let base = get_model_pricing("gpt-4.1").unwrap();
        assert!(mini.input < base.input);
    }

    #[test]
    fn cost_splits_cached_and_fresh_input() {
        let p = ModelPricing { input: 2.0, cached_input: 0.5, output: 8.0 };
        // 1M fresh input = $2, 1M cached = $0.50, 1M output = $8.
        let cost = calculate_cost(&p, 1_000_000, 1_000_000, 1_000_000);
        assert!((cost - 10.5).abs() < 1e-9);
    }

    #[test]
    fn zero_tokens_cost_nothing() {
        let p = get_model_pricing("claude-sonnet-4").unwrap();
        assert_eq!(calculate_cost(&p, 0, 0, 0), 0.0);
    }
}
