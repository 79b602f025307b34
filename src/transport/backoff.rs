//! Backoff
//!
//! Per-endpoint backoff policy and state. Policies are parsed from the
//! compact descriptor strings the configuration layer accepts directly:
//! `E,<initialMs>,<maxMs>,<factor>,<jitter>` for exponential backoff or
//! `L,<stepMs>,<maxMs>` for linear backoff.

use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;

/// A parsed backoff policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BackoffPolicy {
    Exponential {
        initial_ms: u64,
        max_ms: u64,
        factor: f64,
        jitter: f64,
    },
    Linear {
        step_ms: u64,
        max_ms: u64,
    },
}

impl BackoffPolicy {
    /// Parses a descriptor of the form `E,initial,max,factor,jitter` or
    /// `L,step,max`. Returns a human-readable reason string on failure so
    /// callers (the config validator) can surface it as `ConfigInvalid`.
    pub fn parse(descriptor: &str) -> Result<Self, String> {
        let parts: Vec<&str> = descriptor.split(',').collect();
        match parts.as_slice() {
            ["E", initial, max, factor, jitter] => Ok(BackoffPolicy::Exponential {
                initial_ms: parse_u64(initial, "initialMs")?,
                max_ms: parse_u64(max, "maxMs")?,
                factor: parse_f64(factor, "factor")?,
                jitter: parse_f64(jitter, "jitter")?,
            }),
            ["L", step, max] => Ok(BackoffPolicy::Linear {
                step_ms: parse_u64(step, "stepMs")?,
                max_ms: parse_u64(max, "maxMs")?,
            }),
            _ => Err(format!(
                "expected \"E,initial,max,factor,jitter\" or \"L,step,max\", got {descriptor:?}"
            )),
        }
    }

    fn initial_delay(&self) -> Duration {
        match self {
            BackoffPolicy::Exponential { initial_ms, .. } => Duration::from_millis(*initial_ms),
            BackoffPolicy::Linear { step_ms, .. } => Duration::from_millis(*step_ms),
        }
    }

    /// Un-jittered delay for the Nth consecutive failure (0-indexed).
    fn base_delay(&self, consecutive_failures: u32) -> Duration {
        match self {
            BackoffPolicy::Exponential {
                initial_ms,
                max_ms,
                factor,
                ..
            } => {
                let scaled = *initial_ms as f64 * factor.powi(consecutive_failures as i32);
                Duration::from_millis(scaled.min(*max_ms as f64) as u64)
            }
            BackoffPolicy::Linear { step_ms, max_ms } => {
                let scaled = step_ms.saturating_mul(consecutive_failures as u64 + 1);
                Duration::from_millis(scaled.min(*max_ms))
            }
        }
    }

    fn jitter_fraction(&self) -> f64 {
        match self {
            BackoffPolicy::Exponential { jitter, .. } => *jitter,
            BackoffPolicy::Linear { .. } => 0.0,
        }
    }
}

/// Per-endpoint backoff tracking: current delay, consecutive failure count,
/// and the next time a dispatch attempt is permitted.
pub struct BackoffState {
    policy: BackoffPolicy,
    current_delay: Duration,
    consecutive_failures: u32,
    next_allowed_time: Option<Instant>,
}

impl BackoffState {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            current_delay: policy.initial_delay(),
            policy,
            consecutive_failures: 0,
            next_allowed_time: None,
        }
    }

    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn is_backed_off(&self, now: Instant) -> bool {
        self.next_allowed_time.is_some_and(|t| now < t)
    }

    pub fn next_allowed_time(&self) -> Option<Instant> {
        self.next_allowed_time
    }

    /// Applies a retryable failure: advances the failure count, computes the
    /// next delay (clamped to `maxMs`, perturbed by jitter), and arms
    /// `next_allowed_time`.
    pub fn on_retryable_failure(&mut self, now: Instant) {
        let base = self.policy.base_delay(self.consecutive_failures);
        self.consecutive_failures += 1;

        let jitter = self.policy.jitter_fraction();
        let delay = if jitter > 0.0 {
            let mut rng = rand::rng();
            let factor = rng.random_range((1.0 - jitter)..=(1.0 + jitter));
            Duration::from_secs_f64((base.as_secs_f64() * factor).max(0.0))
        } else {
            base
        };

        self.current_delay = delay;
        self.next_allowed_time = Some(now + delay);
    }

    /// Resets backoff state after a successful dispatch.
    pub fn on_success(&mut self) {
        self.consecutive_failures = 0;
        self.current_delay = self.policy.initial_delay();
        self.next_allowed_time = None;
    }
}

fn parse_u64(value: &str, field: &str) -> Result<u64, String> {
    value
        .parse::<u64>()
        .map_err(|_| format!("{field} must be an integer, got {value:?}"))
}

fn parse_f64(value: &str, field: &str) -> Result<f64, String> {
    value
        .parse::<f64>()
        .map_err(|_| format!("{field} must be a number, got {value:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_exponential_descriptor() {
        let policy = BackoffPolicy::parse("E,3000,300000,2,1").unwrap();
        assert_eq!(
            policy,
            BackoffPolicy::Exponential {
                initial_ms: 3000,
                max_ms: 300_000,
                factor: 2.0,
                jitter: 1.0,
            }
        );
    }

    #[test]
    fn parses_linear_descriptor() {
        let policy = BackoffPolicy::parse("L,1000,60000").unwrap();
        assert_eq!(
            policy,
            BackoffPolicy::Linear {
                step_ms: 1000,
                max_ms: 60_000,
            }
        );
    }

    #[test]
    fn rejects_malformed_descriptors() {
        assert!(BackoffPolicy::parse("X,1,2,3").is_err());
        assert!(BackoffPolicy::parse("E,a,b,c,d").is_err());
    }

    #[test]
    fn delay_is_clamped_to_max_ms() {
        let policy = BackoffPolicy::Exponential {
            initial_ms: 1000,
            max_ms: 5000,
            factor: 10.0,
            jitter: 0.0,
        };
        let mut state = BackoffState::new(policy);
        let now = Instant::now();
        for _ in 0..5 {
            state.on_retryable_failure(now);
        }
        assert!(state.current_delay() <= Duration::from_millis(5000));
    }

    #[test]
    fn jitter_stays_within_configured_range() {
        // config `E,3000,300000,2,1`: initial 3000ms, jitter range [1500,4500]
        let policy = BackoffPolicy::Exponential {
            initial_ms: 3000,
            max_ms: 300_000,
            factor: 2.0,
            jitter: 1.0,
        };
        let mut state = BackoffState::new(policy);
        let now = Instant::now();
        for _ in 0..20 {
            state.on_retryable_failure(now);
            assert!(state.current_delay() >= Duration::from_millis(0));
            assert!(state.current_delay() <= Duration::from_millis(6000));
            state.on_success();
        }
    }

    #[test]
    fn success_resets_state() {
        let policy = BackoffPolicy::Exponential {
            initial_ms: 1000,
            max_ms: 60_000,
            factor: 2.0,
            jitter: 0.0,
        };
        let mut state = BackoffState::new(policy);
        let now = Instant::now();
        state.on_retryable_failure(now);
        assert_eq!(state.consecutive_failures(), 1);
        state.on_success();
        assert_eq!(state.consecutive_failures(), 0);
        assert!(!state.is_backed_off(now));
    }
}
