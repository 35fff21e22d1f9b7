//! Alignment severity and loss sizing.
//!
//! Misalignment only counts while the held stance opposes the feature
//! direction. It is integrated into a decaying severity; crossing the
//! threshold decides *when* stones are lost, the pressure at that moment
//! decides *how many*.

use serde::{Deserialize, Serialize};

use crate::features::FeatureVector;
use crate::geometry::DVec2;
use crate::physics::{Body, BodyId};
use crate::stance::Stance;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeverityWeights {
    pub momentum: f64,
    pub imbalance: f64,
    pub volatility: f64,
}

impl SeverityWeights {
    pub fn total(&self) -> f64 {
        self.momentum + self.imbalance + self.volatility
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossConfig {
    /// Most stones a single event may take
    pub max_loss: usize,
    /// Severity must exceed this before anything is lost
    pub threshold: f64,
    /// Share of the stack at stake at full severity
    pub fraction: f64,
    /// Severity per second at full misalignment
    pub gain: f64,
    /// Decay rate per second
    pub decay: f64,
    pub weights: SeverityWeights,
}

impl Default for LossConfig {
    fn default() -> Self {
        crate::state::Config::default().loss()
    }
}

/// Instantaneous misalignment in [0, 1]. Zero when the stance agrees with the
/// features or no stance is held.
pub fn instant_misalignment(fv: &FeatureVector, stance: Stance, weights: &SeverityWeights) -> f64 {
    if stance == Stance::Flat || stance == fv.direction() {
        return 0.0;
    }
    let total = weights.total();
    if total <= 0.0 {
        return 0.0;
    }
    let f = fv.clamped();
    let pressure = weights.momentum * f.momentum.abs()
        + weights.imbalance * f.order_imbalance.abs()
        + weights.volatility * f.volatility.abs();
    (pressure / total).clamp(0.0, 1.0)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SeverityIntegrator {
    severity: f64,
}

impl SeverityIntegrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn severity(&self) -> f64 {
        self.severity
    }

    pub fn update(&mut self, instant: f64, dt_ms: f64, cfg: &LossConfig) -> f64 {
        let dt_s = dt_ms.max(0.0) / 1000.0;
        let decayed = self.severity * (-cfg.decay * dt_s).exp();
        self.severity = (decayed + cfg.gain * instant.clamp(0.0, 1.0) * dt_s).clamp(0.0, 1.0);
        self.severity
    }

    pub fn breached(&self, cfg: &LossConfig) -> bool {
        self.severity > cfg.threshold
    }

    pub fn reset(&mut self) {
        self.severity = 0.0;
    }
}

/// Stones to lose for a given severity and stack height. Zero at or below
/// the threshold; otherwise at least one, non-decreasing in both inputs,
/// never above `max_loss` or the height.
pub fn stones_to_lose(severity: f64, height: usize, cfg: &LossConfig) -> usize {
    if height == 0 || cfg.max_loss == 0 || !(severity > cfg.threshold) {
        return 0;
    }
    let span = (1.0 - cfg.threshold).max(1e-9);
    let over = ((severity.min(1.0) - cfg.threshold) / span).clamp(0.0, 1.0);
    let raw = (over * height as f64 * cfg.fraction.max(0.0)).ceil() as usize;
    raw.max(1).min(cfg.max_loss).min(height)
}

/// The `count` most recently committed bodies, newest first.
pub fn select_most_recent(bodies: &[Body], count: usize) -> Vec<BodyId> {
    let mut order: Vec<(u64, BodyId)> = bodies.iter().map(|b| (b.seq, b.id)).collect();
    order.sort_by(|a, b| b.0.cmp(&a.0));
    order.into_iter().take(count).map(|(_, id)| id).collect()
}

/// Push away from the stack axis and slightly up. Bodies sitting on the axis
/// alternate sides by rank.
pub fn outward_impulse(body: &Body, rank: usize, stack_x: f64, magnitude: f64) -> DVec2 {
    let dx = body.position.x - stack_x;
    let dir = if dx.abs() < 1.0 {
        if rank % 2 == 0 { 1.0 } else { -1.0 }
    } else {
        dx.signum()
    };
    DVec2::new(dir * magnitude * (1.0 + 0.25 * rank as f64), -magnitude * 0.6)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Color, GeometryParams};
    use crate::physics::{PhysicsWorld, SandboxWorld};

    fn cfg(cap: usize) -> LossConfig {
        LossConfig { max_loss: cap, ..LossConfig::default() }
    }

    fn bullish() -> FeatureVector {
        FeatureVector { momentum: 0.9, volatility: 0.4, order_imbalance: 0.7, ..FeatureVector::neutral(0) }
    }

    #[test]
    fn test_loss_is_bounded() {
        assert!(stones_to_lose(1.0, 10, &cfg(3)) <= 3);
        assert_eq!(stones_to_lose(1.0, 10, &cfg(3)), 3);
        for h in 0..50 {
            assert_eq!(stones_to_lose(0.0, h, &cfg(3)), 0);
        }
        assert_eq!(stones_to_lose(1.0, 0, &cfg(3)), 0);
        assert_eq!(stones_to_lose(1.0, 2, &cfg(5)), 1);
        assert_eq!(stones_to_lose(1.0, 30, &cfg(50)), 9);
    }

    #[test]
    fn test_loss_monotonic() {
        let c = LossConfig { max_loss: 100, ..LossConfig::default() };
        let mut prev = 0;
        for i in 0..=100 {
            let n = stones_to_lose(i as f64 / 100.0, 20, &c);
            assert!(n >= prev);
            prev = n;
        }
        let mut prev = 0;
        for h in 0..40 {
            let n = stones_to_lose(0.8, h, &c);
            assert!(n >= prev);
            prev = n;
        }
    }

    #[test]
    fn test_aligned_or_flat_has_no_misalignment() {
        let w = LossConfig::default().weights;
        assert_eq!(instant_misalignment(&bullish(), Stance::Long, &w), 0.0);
        assert_eq!(instant_misalignment(&bullish(), Stance::Flat, &w), 0.0);
        let m = instant_misalignment(&bullish(), Stance::Short, &w);
        assert!(m > 0.5 && m <= 1.0, "m={}", m);
    }

    #[test]
    fn test_integrator_accumulates_and_decays() {
        let c = LossConfig::default();
        let mut s = SeverityIntegrator::new();
        for _ in 0..60 {
            s.update(1.0, 16.0, &c);
        }
        let peak = s.severity();
        assert!(peak > 0.5);
        for _ in 0..60 {
            s.update(0.0, 16.0, &c);
        }
        assert!(s.severity() < peak);
        s.reset();
        assert_eq!(s.severity(), 0.0);
        assert!(!s.breached(&c));
    }

    #[test]
    fn test_selects_newest_bodies() {
        let mut w = SandboxWorld::new(500.0);
        let ids: Vec<_> = (0..5)
            .map(|i| w.add_stone(&[], &GeometryParams::default(), 200.0, 400.0 - i as f64 * 50.0, Color::STONE, 0.0))
            .collect();
        let picked = select_most_recent(w.stones(), 2);
        assert_eq!(picked, vec![ids[4], ids[3]]);
        assert_eq!(select_most_recent(w.stones(), 9).len(), 5);
    }

    #[test]
    fn test_impulse_points_outward() {
        let mut w = SandboxWorld::new(500.0);
        w.add_stone(&[], &GeometryParams::default(), 150.0, 400.0, Color::STONE, 0.0);
        w.add_stone(&[], &GeometryParams::default(), 200.0, 350.0, Color::STONE, 0.0);
        let left = outward_impulse(&w.stones()[0], 0, 200.0, 0.04);
        assert!(left.x < 0.0 && left.y < 0.0);
        let a = outward_impulse(&w.stones()[1], 0, 200.0, 0.04);
        let b = outward_impulse(&w.stones()[1], 1, 200.0, 0.04);
        assert!(a.x > 0.0 && b.x < 0.0);
    }
}
