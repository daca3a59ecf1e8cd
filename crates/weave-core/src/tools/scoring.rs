//! Adapter ranking from exponentially decayed success rate and latency.

use std::sync::Mutex;

use crate::config::ScoringPolicy;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatsSnapshot {
    pub success_rate: f64,
    pub latency_ms: f64,
    pub samples: u64,
}

/// Running EWMA statistics of one adapter. Untried adapters start with a
/// perfect record so they get a chance to be ranked on real data.
pub struct AdapterStats {
    inner: Mutex<StatsSnapshot>,
}

impl Default for AdapterStats {
    fn default() -> Self {
        Self {
            inner: Mutex::new(StatsSnapshot {
                success_rate: 1.0,
                latency_ms: 0.0,
                samples: 0,
            }),
        }
    }
}

impl AdapterStats {
    pub fn record(&self, policy: &ScoringPolicy, success: bool, latency_ms: u64) {
        let Ok(mut s) = self.inner.lock() else {
            return;
        };
        let outcome = if success { 1.0 } else { 0.0 };
        let latency = latency_ms as f64;
        if s.samples == 0 {
            s.success_rate = outcome;
            s.latency_ms = latency;
        } else {
            s.success_rate = (1.0 - policy.decay) * s.success_rate + policy.decay * outcome;
            s.latency_ms = (1.0 - policy.decay) * s.latency_ms + policy.decay * latency;
        }
        s.samples += 1;
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.inner
            .lock()
            .map(|s| *s)
            .unwrap_or(StatsSnapshot {
                success_rate: 0.0,
                latency_ms: f64::MAX,
                samples: 0,
            })
    }

    pub fn score(&self, policy: &ScoringPolicy) -> f64 {
        score(policy, &self.snapshot())
    }
}

pub fn score(policy: &ScoringPolicy, stats: &StatsSnapshot) -> f64 {
    let latency_factor = 1.0 / (1.0 + stats.latency_ms / policy.latency_reference_ms);
    policy.success_weight * stats.success_rate + policy.latency_weight * latency_factor
}
