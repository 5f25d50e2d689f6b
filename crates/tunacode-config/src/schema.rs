// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Hard cap on the per-turn node loop when nothing else stops it.
const DEFAULT_MAX_ITERATIONS: u32 = 15;
const MIN_MAX_ITERATIONS: u32 = 1;
const MAX_MAX_ITERATIONS: u32 = 100;

const DEFAULT_MAX_RETRIES: u32 = 3;

/// Longest permitted fixed pre-request delay, in seconds.
const MAX_REQUEST_DELAY_SECS: f64 = 60.0;

fn default_max_iterations() -> u32 {
    DEFAULT_MAX_ITERATIONS
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

/// Runtime settings recognised by the agent core.
///
/// Where these values come from (config files, CLI flags, environment) is the
/// front-end's business; the core only consumes the deserialised struct.
/// Every field has a default so a missing or empty settings block yields a
/// fully usable configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Hard cap on the per-turn node loop (range 1..=100).
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// HTTP transport retries on 5xx/429, forwarded to the provider layer.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Whether tool parameter schemas are marked strict when sent to the model.
    #[serde(default)]
    pub tool_strict_validation: bool,
    /// Fixed delay applied before each model request, in seconds (0..=60).
    #[serde(default)]
    pub request_delay: f64,
    /// Per-turn wall-clock timeout in seconds.  `None` disables the timeout.
    #[serde(default)]
    pub global_request_timeout: Option<f64>,
    /// Emit additional debug events (part dumps, dispatch diagnostics).
    #[serde(default)]
    pub debug_metrics: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            max_retries: DEFAULT_MAX_RETRIES,
            tool_strict_validation: false,
            request_delay: 0.0,
            global_request_timeout: None,
            debug_metrics: false,
        }
    }
}

impl Settings {
    /// Return a copy with every field forced into its documented range.
    ///
    /// Out-of-range values are clamped rather than rejected so that a bad
    /// config file degrades to something usable instead of aborting startup.
    pub fn clamped(mut self) -> Self {
        if self.max_iterations < MIN_MAX_ITERATIONS || self.max_iterations > MAX_MAX_ITERATIONS {
            warn!(
                max_iterations = self.max_iterations,
                "max_iterations out of range; clamping"
            );
            self.max_iterations = self
                .max_iterations
                .clamp(MIN_MAX_ITERATIONS, MAX_MAX_ITERATIONS);
        }
        if !self.request_delay.is_finite() || self.request_delay < 0.0 {
            warn!(
                request_delay = self.request_delay,
                "request_delay invalid; resetting to 0"
            );
            self.request_delay = 0.0;
        } else if self.request_delay > MAX_REQUEST_DELAY_SECS {
            warn!(
                request_delay = self.request_delay,
                "request_delay above maximum; clamping"
            );
            self.request_delay = MAX_REQUEST_DELAY_SECS;
        }
        if let Some(t) = self.global_request_timeout {
            if !t.is_finite() || t <= 0.0 {
                warn!(timeout = t, "global_request_timeout invalid; disabling");
                self.global_request_timeout = None;
            }
        }
        self
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let s = Settings::default();
        assert_eq!(s.max_iterations, 15);
        assert_eq!(s.max_retries, 3);
        assert!(!s.tool_strict_validation);
        assert_eq!(s.request_delay, 0.0);
        assert!(s.global_request_timeout.is_none());
        assert!(!s.debug_metrics);
    }

    #[test]
    fn empty_json_deserialises_to_defaults() {
        let s: Settings = serde_json::from_str("{}").unwrap();
        assert_eq!(s.max_iterations, Settings::default().max_iterations);
    }

    #[test]
    fn partial_json_keeps_other_defaults() {
        let s: Settings = serde_json::from_str(r#"{"max_iterations": 3}"#).unwrap();
        assert_eq!(s.max_iterations, 3);
        assert_eq!(s.max_retries, 3);
    }

    #[test]
    fn clamp_max_iterations_low_and_high() {
        let s = Settings {
            max_iterations: 0,
            ..Default::default()
        };
        assert_eq!(s.clamped().max_iterations, 1);

        let s = Settings {
            max_iterations: 500,
            ..Default::default()
        };
        assert_eq!(s.clamped().max_iterations, 100);
    }

    #[test]
    fn clamp_request_delay() {
        let s = Settings {
            request_delay: -1.0,
            ..Default::default()
        };
        assert_eq!(s.clamped().request_delay, 0.0);

        let s = Settings {
            request_delay: 120.0,
            ..Default::default()
        };
        assert_eq!(s.clamped().request_delay, 60.0);
    }

    #[test]
    fn clamp_disables_nonpositive_timeout() {
        let s = Settings {
            global_request_timeout: Some(0.0),
            ..Default::default()
        };
        assert!(s.clamped().global_request_timeout.is_none());

        let s = Settings {
            global_request_timeout: Some(30.0),
            ..Default::default()
        };
        assert_eq!(s.clamped().global_request_timeout, Some(30.0));
    }

    #[test]
    fn settings_round_trip() {
        let s = Settings {
            max_iterations: 7,
            request_delay: 1.5,
            global_request_timeout: Some(90.0),
            ..Default::default()
        };
        let json = serde_json::to_string(&s).unwrap();
        let back: Settings = serde_json::from_str(&json).unwrap();
        assert_eq!(back.max_iterations, 7);
        assert_eq!(back.request_delay, 1.5);
        assert_eq!(back.global_request_timeout, Some(90.0));
    }
}
