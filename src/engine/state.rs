//! Engine state: one explicit object owned by the controller.

use std::collections::VecDeque;
use std::f64::consts::PI;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::features::FeatureVector;
use crate::geometry::{
    build_polygon, face_delta, lerp_angle, world_metrics, wrap_angle, Color, GeometryParams, StoneGeometry,
    StoneMetrics, DVec2,
};
use crate::ledger::StackLedger;
use crate::loss::SeverityIntegrator;
use crate::morph::{ease_out_cubic, Morph, Snapshot};
use crate::physics::BodyId;
use crate::scheduler::{CadenceScheduler, TimerSlot};
use crate::stance::{Stance, StanceTracker};

/// Tolerance for the fit check, radians
pub const FIT_EPS: f64 = 1e-6;
const HISTORY_CAP: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Hovering,
    Placing,
    Stable,
    Loss,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Hovering => "hovering",
            Phase::Placing => "placing",
            Phase::Stable => "stable",
            Phase::Loss => "loss",
        }
    }
}

// =============================================================================
// Anomalies (absorbed, never fatal)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Anomaly {
    /// Params outside the safe envelope, clamped before construction
    DegenerateGeometry,
    /// Commit timer fired while commits were disallowed
    SchedulerMisfire,
    /// Resync found no bodies
    EmptyStack,
    /// Commit requested with no hover stone
    MissingHoverStone,
}

impl Anomaly {
    pub fn as_str(&self) -> &'static str {
        match self {
            Anomaly::DegenerateGeometry => "degenerate_geometry",
            Anomaly::SchedulerMisfire => "scheduler_misfire",
            Anomaly::EmptyStack => "empty_stack",
            Anomaly::MissingHoverStone => "missing_hover_stone",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnomalyCounts {
    pub degenerate_geometry: u64,
    pub scheduler_misfire: u64,
    pub empty_stack: u64,
    pub missing_hover_stone: u64,
}

impl AnomalyCounts {
    pub fn record(&mut self, a: Anomaly) {
        *self.slot(a) += 1;
    }

    pub fn get(&self, a: Anomaly) -> u64 {
        match a {
            Anomaly::DegenerateGeometry => self.degenerate_geometry,
            Anomaly::SchedulerMisfire => self.scheduler_misfire,
            Anomaly::EmptyStack => self.empty_stack,
            Anomaly::MissingHoverStone => self.missing_hover_stone,
        }
    }

    fn slot(&mut self, a: Anomaly) -> &mut u64 {
        match a {
            Anomaly::DegenerateGeometry => &mut self.degenerate_geometry,
            Anomaly::SchedulerMisfire => &mut self.scheduler_misfire,
            Anomaly::EmptyStack => &mut self.empty_stack,
            Anomaly::MissingHoverStone => &mut self.missing_hover_stone,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub ticks: u64,
    pub samples: u64,
    pub commits: u64,
    pub discards: u64,
    pub loss_events: u64,
    pub stones_lost: u64,
    pub anomalies: AnomalyCounts,
}

// =============================================================================
// Stones in flight
// =============================================================================

/// The pending stone, morphing with every sample until the cadence fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HoverStone {
    pub id: u64,
    pub morph: Morph,
    /// Sample behind the current morph target
    pub source: FeatureVector,
    pub implied: Stance,
    pub stance: Stance,
    pub marked_for_discard: bool,
    /// Sanitized params of the current interpolated shape
    pub params: GeometryParams,
    pub metrics: StoneMetrics,
    pub center: DVec2,
    pub rotation: f64,
}

impl HoverStone {
    pub fn new(id: u64, initial: Snapshot, source: FeatureVector, stance: Stance, update_cap: u32, stack_x: f64) -> Self {
        let mut hover = Self {
            id,
            morph: Morph::new(initial, update_cap),
            source,
            implied: source.direction(),
            stance,
            marked_for_discard: false,
            params: initial.params,
            metrics: StoneMetrics {
                bottom_midpoint: DVec2::ZERO,
                top_midpoint: DVec2::ZERO,
                bottom_angle: 0.0,
                top_angle: 0.0,
                bottom_width: 0.0,
                top_width: 0.0,
            },
            center: DVec2::ZERO,
            rotation: 0.0,
        };
        hover.refresh(stack_x);
        hover
    }

    /// Recompute world-frame fields from the current snapshot and stance.
    pub fn refresh(&mut self, stack_x: f64) {
        let snap = self.morph.current;
        let (params, _) = snap.params.sanitized();
        let polygon = build_polygon(&params);
        let mirrored = self.stance.is_mirrored();
        let rotation = if mirrored { wrap_angle(snap.angle_long + PI) } else { snap.angle_long };
        let center = DVec2::new(stack_x + snap.drift_x, snap.center_y);
        self.metrics = world_metrics(&params, &polygon, rotation, mirrored, center);
        self.params = params;
        self.center = center;
        self.rotation = rotation;
    }

    pub fn color(&self) -> Color {
        self.morph.current.color
    }

    pub fn transition_progress(&self) -> Option<f64> {
        self.morph.transition.as_ref().map(|t| t.progress())
    }
}

/// A committed stone animating down onto the stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacingStone {
    pub id: u64,
    pub geometry: StoneGeometry,
    pub stance: Stance,
    pub color: Color,
    pub from_center: DVec2,
    pub from_rotation: f64,
    pub to_center: DVec2,
    pub to_rotation: f64,
    /// Landing metrics; what the ledger commits
    pub target: StoneMetrics,
    pub elapsed_ms: f64,
    pub duration_ms: f64,
}

impl PlacingStone {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u64,
        geometry: StoneGeometry,
        stance: Stance,
        color: Color,
        from_center: DVec2,
        from_rotation: f64,
        stack_x: f64,
        top_y: f64,
        duration_ms: f64,
    ) -> Self {
        let to_center = geometry.landing_center(stance, stack_x, top_y);
        let target = geometry.metrics(stance, to_center);
        Self {
            id,
            to_rotation: geometry.rotation(stance),
            geometry,
            stance,
            color,
            from_center,
            from_rotation,
            to_center,
            target,
            elapsed_ms: 0.0,
            duration_ms: duration_ms.max(0.0),
        }
    }

    pub fn progress(&self) -> f64 {
        if self.duration_ms <= 0.0 {
            return 1.0;
        }
        (self.elapsed_ms / self.duration_ms).clamp(0.0, 1.0)
    }

    /// Returns true once the stone has landed.
    pub fn advance(&mut self, dt_ms: f64) -> bool {
        self.elapsed_ms = (self.elapsed_ms + dt_ms.max(0.0)).min(self.duration_ms);
        self.is_done()
    }

    pub fn is_done(&self) -> bool {
        self.elapsed_ms >= self.duration_ms
    }

    /// Current (center, rotation)
    pub fn pose(&self) -> (DVec2, f64) {
        let t = ease_out_cubic(self.progress());
        (
            self.from_center.lerp(self.to_center, t),
            lerp_angle(self.from_rotation, self.to_rotation, t),
        )
    }

    /// Bottom face lies on the previous top face.
    pub fn fits(&self) -> bool {
        face_delta(self.geometry.prev_orientation, self.target.bottom_angle).abs() < FIT_EPS
    }
}

// =============================================================================
// History
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub id: u64,
    pub stance: Stance,
    pub implied: Stance,
    pub prev_orientation: f64,
    pub bottom_angle: f64,
    pub top_angle: f64,
    pub top_surface_y: f64,
    pub fit: bool,
}

// =============================================================================
// Engine state
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineState {
    pub phase: Phase,
    pub ledger: StackLedger,
    pub hover: Option<HoverStone>,
    pub placing: Option<PlacingStone>,
    pub stance: StanceTracker,
    pub latest: Option<FeatureVector>,
    pub severity: SeverityIntegrator,
    pub scheduler: CadenceScheduler,
    pub settle: TimerSlot,
    /// Bodies tumbling in the current loss event
    pub pending_loss: Vec<BodyId>,
    pub history: VecDeque<CommitRecord>,
    pub counters: Counters,
    pub now: u64,
    pub last_tick: Option<u64>,
    pub next_stone_id: u64,
}

impl EngineState {
    pub fn new(ground_y: f64, cadence_ms: u64, stance: Stance) -> Self {
        Self {
            phase: Phase::Stable,
            ledger: StackLedger::new(ground_y),
            hover: None,
            placing: None,
            stance: StanceTracker::new(stance),
            latest: None,
            severity: SeverityIntegrator::new(),
            scheduler: CadenceScheduler::new(cadence_ms),
            settle: TimerSlot::new(),
            pending_loss: Vec::new(),
            history: VecDeque::with_capacity(HISTORY_CAP),
            counters: Counters::default(),
            now: 0,
            last_tick: None,
            next_stone_id: 1,
        }
    }

    pub fn take_stone_id(&mut self) -> u64 {
        let id = self.next_stone_id;
        self.next_stone_id += 1;
        id
    }

    pub fn record_commit(&mut self, rec: CommitRecord) {
        if self.history.len() >= HISTORY_CAP {
            self.history.pop_front();
        }
        self.history.push_back(rec);
    }

    /// SHA-256 over ledger, history and counters, for replay comparison.
    pub fn digest(&self) -> String {
        let payload = serde_json::to_vec(&(&self.ledger, &self.history, &self.counters)).unwrap_or_default();
        hex::encode(Sha256::digest(&payload))
    }
}

/// Read-only view handed to the presentation layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub phase: Phase,
    pub stance: Stance,
    pub hover: Option<HoverStone>,
    pub placing: Option<PlacingStone>,
    pub ledger: StackLedger,
    /// Share of the current cadence interval elapsed, [0, 1]
    pub decision_progress: f64,
    /// Eased progress of the hover stone's active morph, if any
    pub morph_progress: Option<f64>,
    pub severity: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placing_stone_lands_on_target() {
        let g = StoneGeometry::build(&GeometryParams::default(), 0.1, Stance::Long);
        let mut p = PlacingStone::new(3, g, Stance::Long, Color::STONE, DVec2::new(200.0, 100.0), 0.5, 200.0, 500.0, 450.0);
        assert!(p.fits());
        assert!(!p.advance(200.0));
        let (mid, _) = p.pose();
        assert!(mid.y > 100.0 && mid.y < p.to_center.y);
        assert!(p.advance(300.0));
        let (end, rot) = p.pose();
        assert!((end.y - p.to_center.y).abs() < 1e-9);
        assert!((rot - p.to_rotation).abs() < 1e-9);
        assert!((p.target.bottom_midpoint.y - 500.0).abs() < 1e-9);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut s = EngineState::new(560.0, 1000, Stance::Long);
        let rec = CommitRecord {
            id: 0,
            stance: Stance::Long,
            implied: Stance::Long,
            prev_orientation: 0.0,
            bottom_angle: 0.0,
            top_angle: 0.0,
            top_surface_y: 0.0,
            fit: true,
        };
        for i in 0..(HISTORY_CAP + 10) {
            s.record_commit(CommitRecord { id: i as u64, ..rec });
        }
        assert_eq!(s.history.len(), HISTORY_CAP);
        assert_eq!(s.history.front().unwrap().id, 10);
    }

    #[test]
    fn test_digest_tracks_ledger() {
        let mut s = EngineState::new(560.0, 1000, Stance::Long);
        let d0 = s.digest();
        assert_eq!(d0.len(), 64);
        assert_eq!(d0, s.digest());
        s.ledger.committed_count = 1;
        assert_ne!(d0, s.digest());
    }

    #[test]
    fn test_anomaly_counts() {
        let mut c = AnomalyCounts::default();
        c.record(Anomaly::SchedulerMisfire);
        c.record(Anomaly::SchedulerMisfire);
        assert_eq!(c.get(Anomaly::SchedulerMisfire), 2);
        assert_eq!(c.get(Anomaly::EmptyStack), 0);
    }
}
