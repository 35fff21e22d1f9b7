//! Physics collaborator interface.
//!
//! The engine only needs a handful of calls: add a frozen stone on commit,
//! read and push bodies during a loss event, and drop bodies once they have
//! tumbled out of play. [`SandboxWorld`] is a small ballistic stand-in used by
//! the headless driver and the tests; it has no contacts or stacking solver.

use serde::{Deserialize, Serialize};

use crate::geometry::{Color, GeometryParams, DVec2};
use crate::logging::{log, obj, Domain, Level};
use serde_json::json;

pub type BodyId = u64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Body {
    pub id: BodyId,
    /// Commit order; higher is more recent
    pub seq: u64,
    pub position: DVec2,
    pub angle: f64,
    pub local_vertices: Vec<DVec2>,
    /// World-frame vertices
    pub vertices: Vec<DVec2>,
    pub velocity: DVec2,
    pub angular_velocity: f64,
    /// Applied on the next step, then cleared
    pub force: DVec2,
    /// Kinematically frozen until woken by a loss event
    pub frozen: bool,
    pub color: Color,
    pub params: GeometryParams,
}

impl Body {
    /// Smallest y over the outline (screen y grows down)
    pub fn top_edge_y(&self) -> f64 {
        if self.vertices.is_empty() {
            return self.position.y;
        }
        self.vertices.iter().map(|v| v.y).fold(f64::INFINITY, f64::min)
    }

    pub fn sync_vertices(&mut self) {
        let (pos, angle) = (self.position, self.angle);
        let turn = DVec2::from_angle(angle);
        self.vertices = self.local_vertices.iter().map(|v| turn.rotate(*v) + pos).collect();
    }
}

pub trait PhysicsWorld {
    /// Add a frozen body. `vertices` are local to (x, y) and unrotated.
    fn add_stone(
        &mut self,
        vertices: &[DVec2],
        params: &GeometryParams,
        x: f64,
        y: f64,
        color: Color,
        orientation: f64,
    ) -> BodyId;

    fn stones(&self) -> &[Body];

    fn stones_mut(&mut self) -> &mut [Body];

    /// Let a frozen body simulate. False if the id is unknown.
    fn wake(&mut self, id: BodyId) -> bool;

    fn remove_stone(&mut self, id: BodyId) -> bool;

    fn step(&mut self, dt_ms: f64);
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxWorld {
    bodies: Vec<Body>,
    next_id: BodyId,
    /// px/ms²
    pub gravity: f64,
    /// Awake bodies whose top edge passes this line are dropped
    pub despawn_y: f64,
    pub spin: f64,
}

impl SandboxWorld {
    pub fn new(floor_y: f64) -> Self {
        Self { bodies: Vec::new(), next_id: 1, gravity: 0.002, despawn_y: floor_y + 600.0, spin: 0.05 }
    }

    pub fn len(&self) -> usize {
        self.bodies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty()
    }
}

impl PhysicsWorld for SandboxWorld {
    fn add_stone(
        &mut self,
        vertices: &[DVec2],
        params: &GeometryParams,
        x: f64,
        y: f64,
        color: Color,
        orientation: f64,
    ) -> BodyId {
        let id = self.next_id;
        self.next_id += 1;
        let mut body = Body {
            id,
            seq: id,
            position: DVec2::new(x, y),
            angle: orientation,
            local_vertices: vertices.to_vec(),
            vertices: Vec::new(),
            velocity: DVec2::ZERO,
            angular_velocity: 0.0,
            force: DVec2::ZERO,
            frozen: true,
            color,
            params: *params,
        };
        body.sync_vertices();
        self.bodies.push(body);
        id
    }

    fn stones(&self) -> &[Body] {
        &self.bodies
    }

    fn stones_mut(&mut self) -> &mut [Body] {
        &mut self.bodies
    }

    fn wake(&mut self, id: BodyId) -> bool {
        match self.bodies.iter_mut().find(|b| b.id == id) {
            Some(b) => {
                b.frozen = false;
                true
            }
            None => false,
        }
    }

    fn remove_stone(&mut self, id: BodyId) -> bool {
        let before = self.bodies.len();
        self.bodies.retain(|b| b.id != id);
        self.bodies.len() != before
    }

    fn step(&mut self, dt_ms: f64) {
        let dt = dt_ms.max(0.0);
        for b in self.bodies.iter_mut().filter(|b| !b.frozen) {
            b.velocity += (b.force + DVec2::new(0.0, self.gravity)) * dt;
            b.angular_velocity += b.force.x * self.spin * dt;
            b.force = DVec2::ZERO;
            b.position += b.velocity * dt;
            b.angle += b.angular_velocity * dt;
            b.sync_vertices();
        }
        let despawn_y = self.despawn_y;
        let before = self.bodies.len();
        self.bodies.retain(|b| b.frozen || b.top_edge_y() <= despawn_y);
        if self.bodies.len() != before {
            log(
                Level::Debug,
                Domain::Physics,
                "despawned",
                obj(&[("count", json!(before - self.bodies.len())), ("remaining", json!(self.bodies.len()))]),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::f64::consts::FRAC_PI_2;

    use super::*;

    fn square() -> Vec<DVec2> {
        vec![DVec2::new(-10.0, 10.0), DVec2::new(10.0, 10.0), DVec2::new(10.0, -10.0), DVec2::new(-10.0, -10.0)]
    }

    #[test]
    fn test_added_stone_is_frozen_in_place() {
        let mut w = SandboxWorld::new(500.0);
        let id = w.add_stone(&square(), &GeometryParams::default(), 100.0, 200.0, Color::STONE, 0.0);
        w.step(1000.0);
        let b = &w.stones()[0];
        assert_eq!(b.id, id);
        assert!(b.frozen);
        assert_eq!(b.position, DVec2::new(100.0, 200.0));
        assert!((b.top_edge_y() - 190.0).abs() < 1e-9);
    }

    #[test]
    fn test_woken_stone_tumbles_and_despawns() {
        let mut w = SandboxWorld::new(500.0);
        let keep = w.add_stone(&square(), &GeometryParams::default(), 100.0, 480.0, Color::STONE, 0.0);
        let lost = w.add_stone(&square(), &GeometryParams::default(), 100.0, 460.0, Color::STONE, 0.0);
        assert!(w.wake(lost));
        w.stones_mut()[1].force = DVec2::new(0.04, -0.02);
        w.step(16.0);
        assert!(w.stones()[1].position.x > 100.0);
        assert!(w.stones()[1].angle != 0.0);
        for _ in 0..200 {
            w.step(16.0);
        }
        assert_eq!(w.len(), 1);
        assert_eq!(w.stones()[0].id, keep);
    }

    #[test]
    fn test_vertices_follow_body_rotation() {
        let mut w = SandboxWorld::new(500.0);
        w.add_stone(&square(), &GeometryParams::default(), 50.0, 60.0, Color::STONE, FRAC_PI_2);
        let b = &w.stones()[0];
        assert!((b.vertices[0] - DVec2::new(40.0, 50.0)).length() < 1e-9);
        assert!((b.vertices[2] - DVec2::new(60.0, 70.0)).length() < 1e-9);
        assert!((b.top_edge_y() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_remove_and_wake_unknown() {
        let mut w = SandboxWorld::new(500.0);
        let id = w.add_stone(&square(), &GeometryParams::default(), 0.0, 0.0, Color::STONE, 0.3);
        assert!(!w.wake(999));
        assert!(w.remove_stone(id));
        assert!(!w.remove_stone(id));
        assert!(w.is_empty());
    }
}
