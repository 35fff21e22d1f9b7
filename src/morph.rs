//! Continuous morphing of the pending stone between feature samples.
//!
//! One transition at a time. A new target never queues: whatever the stone
//! looks like right now becomes the new starting point and the clock restarts.

use serde::{Deserialize, Serialize};

use crate::features::FeatureVector;
use crate::geometry::{lerp_angle, Color, GeometryParams};

/// Everything about a hover stone that animates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub params: GeometryParams,
    pub color: Color,
    pub facet_strength: f64,
    /// Horizontal lean toward the feature direction
    pub drift_x: f64,
    pub angle_long: f64,
    pub center_y: f64,
}

impl Snapshot {
    /// Appearance-only fields derived from a sample; geometry fields are
    /// filled in by the caller.
    pub fn appearance(fv: &FeatureVector) -> (Color, f64, f64) {
        let f = fv.clamped();
        (Color::from_features(&f), 0.2 + 0.8 * f.volatility, 24.0 * f.momentum)
    }

    pub fn lerp(a: &Snapshot, b: &Snapshot, t: f64) -> Snapshot {
        Snapshot {
            params: GeometryParams::lerp(&a.params, &b.params, t),
            color: Color::lerp(a.color, b.color, t),
            facet_strength: a.facet_strength + (b.facet_strength - a.facet_strength) * t,
            drift_x: a.drift_x + (b.drift_x - a.drift_x) * t,
            angle_long: lerp_angle(a.angle_long, b.angle_long, t),
            center_y: a.center_y + (b.center_y - a.center_y) * t,
        }
    }
}

pub fn ease_in_out_cubic(t: f64) -> f64 {
    let t = t.clamp(0.0, 1.0);
    if t < 0.5 {
        4.0 * t * t * t
    } else {
        1.0 - (-2.0 * t + 2.0).powi(3) / 2.0
    }
}

pub fn ease_out_cubic(t: f64) -> f64 {
    1.0 - (1.0 - t.clamp(0.0, 1.0)).powi(3)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    pub from: Snapshot,
    pub target: Snapshot,
    pub elapsed_ms: f64,
    pub duration_ms: f64,
}

impl Transition {
    pub fn new(from: Snapshot, target: Snapshot, duration_ms: f64) -> Self {
        Self { from, target, elapsed_ms: 0.0, duration_ms: duration_ms.max(0.0) }
    }

    /// Eased progress in [0, 1]
    pub fn progress(&self) -> f64 {
        if self.duration_ms <= 0.0 {
            return 1.0;
        }
        ease_in_out_cubic(self.elapsed_ms / self.duration_ms)
    }

    pub fn is_done(&self) -> bool {
        self.elapsed_ms >= self.duration_ms
    }

    pub fn sample(&self) -> Snapshot {
        Snapshot::lerp(&self.from, &self.target, self.progress())
    }

    pub fn advance(&mut self, dt_ms: f64) -> Snapshot {
        self.elapsed_ms = (self.elapsed_ms + dt_ms.max(0.0)).min(self.duration_ms);
        self.sample()
    }
}

/// Morph bookkeeping carried by a hover stone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Morph {
    pub current: Snapshot,
    pub transition: Option<Transition>,
    pub updates_applied: u32,
    pub update_cap: u32,
}

impl Morph {
    pub fn new(initial: Snapshot, update_cap: u32) -> Self {
        Self { current: initial, transition: None, updates_applied: 0, update_cap }
    }

    /// Start a transition toward `target` from the current interpolated
    /// state. Returns false once the update cap is spent.
    pub fn retarget(&mut self, target: Snapshot, duration_ms: f64) -> bool {
        if self.updates_applied >= self.update_cap {
            return false;
        }
        self.updates_applied += 1;
        self.transition = Some(Transition::new(self.current, target, duration_ms));
        if duration_ms <= 0.0 {
            self.current = target;
            self.transition = None;
        }
        true
    }

    pub fn advance(&mut self, dt_ms: f64) {
        if let Some(tr) = self.transition.as_mut() {
            self.current = tr.advance(dt_ms);
            if tr.is_done() {
                self.current = tr.target;
                self.transition = None;
            }
        }
    }

    /// Drop any in-flight transition where it stands.
    pub fn retire(&mut self) {
        self.transition = None;
    }

    /// Final resting state: the active target, or the current state.
    pub fn settled(&self) -> Snapshot {
        self.transition.as_ref().map(|t| t.target).unwrap_or(self.current)
    }

    pub fn is_animating(&self) -> bool {
        self.transition.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    fn snap(width: f64, angle: f64, y: f64) -> Snapshot {
        Snapshot {
            params: GeometryParams { base_width: width, ..Default::default() },
            color: Color { r: 0.0, g: 0.0, b: 0.0 },
            facet_strength: 0.2,
            drift_x: 0.0,
            angle_long: angle,
            center_y: y,
        }
    }

    #[test]
    fn test_easing_endpoints() {
        assert_eq!(ease_in_out_cubic(0.0), 0.0);
        assert_eq!(ease_in_out_cubic(1.0), 1.0);
        assert!((ease_in_out_cubic(0.5) - 0.5).abs() < 1e-12);
        assert_eq!(ease_out_cubic(1.0), 1.0);
    }

    #[test]
    fn test_transition_reaches_target_and_retires() {
        let mut m = Morph::new(snap(80.0, 0.0, 100.0), 10);
        assert!(m.retarget(snap(120.0, 0.3, 60.0), 650.0));
        m.advance(325.0);
        assert!(m.is_animating());
        assert!((m.current.params.base_width - 100.0).abs() < 1e-9);
        m.advance(400.0);
        assert!(!m.is_animating());
        assert_eq!(m.current, snap(120.0, 0.3, 60.0));
    }

    #[test]
    fn test_angle_interpolates_across_wrap() {
        let a = snap(80.0, PI - 0.05, 0.0);
        let b = snap(80.0, -PI + 0.05, 0.0);
        let mid = Snapshot::lerp(&a, &b, 0.5);
        // short way passes through ±π, never through 0
        assert!(mid.angle_long.abs() > PI - 0.051);
    }

    #[test]
    fn test_new_sample_supersedes_without_jump() {
        let mut m = Morph::new(snap(80.0, 0.0, 100.0), 10);
        m.retarget(snap(140.0, 0.4, 40.0), 650.0);
        m.advance(300.0);
        let before = m.current;

        m.retarget(snap(60.0, -0.4, 120.0), 650.0);
        let tr = m.transition.as_ref().unwrap();
        assert_eq!(tr.elapsed_ms, 0.0);
        assert_eq!(tr.from, before);
        assert_eq!(m.current, before);

        m.advance(1.0);
        let after = m.current;
        assert!((after.params.base_width - before.params.base_width).abs() < 1e-3);
        assert!((after.angle_long - before.angle_long).abs() < 1e-5);
        assert!((after.center_y - before.center_y).abs() < 1e-3);
    }

    #[test]
    fn test_update_cap() {
        let mut m = Morph::new(snap(80.0, 0.0, 0.0), 2);
        assert!(m.retarget(snap(90.0, 0.0, 0.0), 100.0));
        assert!(m.retarget(snap(100.0, 0.0, 0.0), 100.0));
        assert!(!m.retarget(snap(110.0, 0.0, 0.0), 100.0));
        assert_eq!(m.settled().params.base_width, 100.0);
    }

    #[test]
    fn test_zero_duration_snaps() {
        let mut m = Morph::new(snap(80.0, 0.0, 0.0), 5);
        m.retarget(snap(90.0, 0.1, 5.0), 0.0);
        assert!(!m.is_animating());
        assert_eq!(m.current.params.base_width, 90.0);
    }
}
