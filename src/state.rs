use anyhow::{ensure, Result};

use crate::loss::{LossConfig, SeverityWeights};
use crate::stance::Stance;

/// Runtime configuration. Every field can be overridden from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Commit cadence before time scaling
    pub cadence_ms: u64,
    /// Global speed multiplier applied to every duration
    pub time_scale: f64,
    pub morph_ms: f64,
    pub placement_ms: f64,
    /// Delay before the ledger resyncs after a loss event
    pub settle_ms: u64,
    pub sample_ms: u64,
    pub tick_ms: u64,
    /// Max feature updates a single hover stone will morph through
    pub morph_cap: u32,
    pub max_loss: usize,
    pub loss_threshold: f64,
    pub loss_fraction: f64,
    /// Severity gained per second at full misalignment
    pub severity_gain: f64,
    /// Fraction of severity shed per second
    pub severity_decay: f64,
    pub w_momentum: f64,
    pub w_imbalance: f64,
    pub w_volatility: f64,
    pub prepopulate: usize,
    pub ground_y: f64,
    pub stack_x: f64,
    pub hover_lift: f64,
    pub loss_impulse: f64,
    pub seed: u64,
    pub initial_stance: Stance,
    pub feature_csv: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cadence_ms: 4000,
            time_scale: 1.0,
            morph_ms: 650.0,
            placement_ms: 450.0,
            settle_ms: 1800,
            sample_ms: 1000,
            tick_ms: 16,
            morph_cap: 24,
            max_loss: 3,
            loss_threshold: 0.35,
            loss_fraction: 0.3,
            severity_gain: 0.6,
            severity_decay: 0.15,
            w_momentum: 0.5,
            w_imbalance: 0.3,
            w_volatility: 0.2,
            prepopulate: 10,
            ground_y: 560.0,
            stack_x: 200.0,
            hover_lift: 140.0,
            loss_impulse: 0.04,
            seed: 7,
            initial_stance: Stance::Long,
            feature_csv: None,
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            cadence_ms: env_or("CADENCE_MS", d.cadence_ms),
            time_scale: env_or("TIME_SCALE", d.time_scale),
            morph_ms: env_or("MORPH_MS", d.morph_ms),
            placement_ms: env_or("PLACEMENT_MS", d.placement_ms),
            settle_ms: env_or("SETTLE_MS", d.settle_ms),
            sample_ms: env_or("SAMPLE_MS", d.sample_ms),
            tick_ms: env_or("TICK_MS", d.tick_ms),
            morph_cap: env_or("MORPH_CAP", d.morph_cap),
            max_loss: env_or("MAX_LOSS", d.max_loss),
            loss_threshold: env_or("LOSS_THRESHOLD", d.loss_threshold),
            loss_fraction: env_or("LOSS_FRACTION", d.loss_fraction),
            severity_gain: env_or("SEVERITY_GAIN", d.severity_gain),
            severity_decay: env_or("SEVERITY_DECAY", d.severity_decay),
            w_momentum: env_or("W_MOMENTUM", d.w_momentum),
            w_imbalance: env_or("W_IMBALANCE", d.w_imbalance),
            w_volatility: env_or("W_VOLATILITY", d.w_volatility),
            prepopulate: env_or("PREPOPULATE", d.prepopulate),
            ground_y: env_or("GROUND_Y", d.ground_y),
            stack_x: env_or("STACK_X", d.stack_x),
            hover_lift: env_or("HOVER_LIFT", d.hover_lift),
            loss_impulse: env_or("LOSS_IMPULSE", d.loss_impulse),
            seed: env_or("SEED", d.seed),
            initial_stance: env_or("STANCE", d.initial_stance),
            feature_csv: std::env::var("FEATURE_CSV").ok().filter(|p| !p.is_empty()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.time_scale.is_finite() && self.time_scale > 0.0, "TIME_SCALE must be > 0, got {}", self.time_scale);
        ensure!(self.cadence_ms > 0, "CADENCE_MS must be > 0");
        ensure!(self.tick_ms > 0, "TICK_MS must be > 0");
        ensure!(self.sample_ms > 0, "SAMPLE_MS must be > 0");
        ensure!(self.morph_ms >= 0.0 && self.placement_ms >= 0.0, "animation durations must be >= 0");
        ensure!(
            (0.0..1.0).contains(&self.loss_threshold),
            "LOSS_THRESHOLD must be in [0, 1), got {}",
            self.loss_threshold
        );
        ensure!(self.severity_decay >= 0.0 && self.severity_gain >= 0.0, "severity rates must be >= 0");
        let w = self.weights();
        ensure!(w.total() > 0.0, "severity weights must not all be zero");
        Ok(())
    }

    /// Cadence interval after time scaling, in ms
    pub fn cadence_interval_ms(&self) -> u64 {
        ((self.cadence_ms as f64 / self.time_scale).round() as u64).max(1)
    }

    pub fn morph_duration_ms(&self) -> f64 {
        self.morph_ms / self.time_scale
    }

    pub fn placement_duration_ms(&self) -> f64 {
        self.placement_ms / self.time_scale
    }

    pub fn settle_delay_ms(&self) -> u64 {
        (self.settle_ms as f64 / self.time_scale).round() as u64
    }

    pub fn weights(&self) -> SeverityWeights {
        SeverityWeights {
            momentum: self.w_momentum.max(0.0),
            imbalance: self.w_imbalance.max(0.0),
            volatility: self.w_volatility.max(0.0),
        }
    }

    pub fn loss(&self) -> LossConfig {
        LossConfig {
            max_loss: self.max_loss,
            threshold: self.loss_threshold,
            fraction: self.loss_fraction,
            gain: self.severity_gain,
            decay: self.severity_decay,
            weights: self.weights(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_time_scale_shortens_durations() {
        let cfg = Config { cadence_ms: 1000, morph_ms: 650.0, time_scale: 2.0, ..Default::default() };
        assert_eq!(cfg.cadence_interval_ms(), 500);
        assert!((cfg.morph_duration_ms() - 325.0).abs() < 1e-9);
    }

    #[test]
    fn test_rejects_zero_time_scale() {
        let cfg = Config { time_scale: 0.0, ..Default::default() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_weights() {
        let cfg = Config { w_momentum: 0.0, w_imbalance: 0.0, w_volatility: 0.0, ..Default::default() };
        assert!(cfg.validate().is_err());
    }
}
