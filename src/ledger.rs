//! Authoritative stack reference frame.
//!
//! Written on exactly three occasions: a placement commits, a loss settles,
//! or the stack is pre-populated at startup. Each write takes its values from
//! a single source; nothing is blended.

use serde::{Deserialize, Serialize};

use crate::engine::state::PlacingStone;
use crate::logging::{log, obj, v_num, Domain, Level};
use crate::physics::PhysicsWorld;
use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StackLedger {
    /// y of the surface the next stone lands on (screen y grows down)
    pub top_surface_y: f64,
    /// Face angle of that surface
    pub top_orientation: f64,
    pub committed_count: usize,
    pub ground_y: f64,
}

/// How a resync ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resync {
    Settled,
    /// No bodies left; ledger is back at ground state
    EmptyStack,
}

impl StackLedger {
    pub fn new(ground_y: f64) -> Self {
        Self { top_surface_y: ground_y, top_orientation: 0.0, committed_count: 0, ground_y }
    }

    pub fn is_empty(&self) -> bool {
        self.committed_count == 0
    }

    pub fn reset_to_ground(&mut self) {
        self.top_surface_y = self.ground_y;
        self.top_orientation = 0.0;
        self.committed_count = 0;
    }

    /// Rebuild from whatever bodies survived. Orientation goes back to level:
    /// a tumble does not preserve it.
    pub fn recalculate_from_physics<P: PhysicsWorld + ?Sized>(&mut self, world: &P) -> Resync {
        let bodies = world.stones();
        if bodies.is_empty() {
            self.reset_to_ground();
            log(Level::Info, Domain::Ledger, "ground_state", obj(&[("top_surface_y", v_num(self.top_surface_y))]));
            return Resync::EmptyStack;
        }
        let top = bodies.iter().map(|b| b.top_edge_y()).fold(f64::INFINITY, f64::min);
        self.top_surface_y = top.min(self.ground_y);
        self.top_orientation = 0.0;
        self.committed_count = bodies.len();
        log(
            Level::Debug,
            Domain::Ledger,
            "recalculated",
            obj(&[("top_surface_y", v_num(self.top_surface_y)), ("committed_count", json!(self.committed_count))]),
        );
        Resync::Settled
    }

    /// Take the frame from the placed stone's landing metrics. Physics is
    /// not consulted; the body stays frozen where it was put.
    pub fn commit_from_placement(&mut self, stone: &PlacingStone) {
        self.top_surface_y = stone.target.top_midpoint.y;
        self.top_orientation = stone.target.top_angle;
        self.committed_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Color, GeometryParams, StoneGeometry, DVec2};
    use crate::physics::SandboxWorld;
    use crate::stance::Stance;

    #[test]
    fn test_empty_physics_resets_to_ground() {
        let mut ledger = StackLedger { top_surface_y: 100.0, top_orientation: 0.3, committed_count: 4, ground_y: 560.0 };
        let world = SandboxWorld::new(560.0);
        assert_eq!(ledger.recalculate_from_physics(&world), Resync::EmptyStack);
        assert_eq!(ledger, StackLedger::new(560.0));
    }

    #[test]
    fn test_recalculate_uses_highest_top_edge_and_levels() {
        let mut world = SandboxWorld::new(560.0);
        let square = [DVec2::new(-10.0, 10.0), DVec2::new(10.0, 10.0), DVec2::new(10.0, -10.0), DVec2::new(-10.0, -10.0)];
        world.add_stone(&square, &GeometryParams::default(), 200.0, 550.0, Color::STONE, 0.0);
        world.add_stone(&square, &GeometryParams::default(), 200.0, 530.0, Color::STONE, 0.2);
        let mut ledger = StackLedger { top_orientation: 0.4, ..StackLedger::new(560.0) };
        assert_eq!(ledger.recalculate_from_physics(&world), Resync::Settled);
        assert_eq!(ledger.committed_count, 2);
        assert_eq!(ledger.top_orientation, 0.0);
        assert!(ledger.top_surface_y < 520.0);
    }

    #[test]
    fn test_commit_takes_target_top_face() {
        let geometry = StoneGeometry::build(
            &GeometryParams { top_angle_offset: 0.2, ..Default::default() },
            0.0,
            Stance::Long,
        );
        let placing = PlacingStone::new(1, geometry, Stance::Long, Color::STONE, DVec2::new(200.0, 300.0), 0.0, 200.0, 560.0, 450.0);
        let mut ledger = StackLedger::new(560.0);
        ledger.commit_from_placement(&placing);
        assert_eq!(ledger.committed_count, 1);
        assert_eq!(ledger.top_orientation, placing.target.top_angle);
        assert!((ledger.top_orientation - 0.2).abs() < 1e-9);
        assert!(ledger.top_surface_y < 560.0);
    }
}
