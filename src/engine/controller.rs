//! Engine controller: owns the state, the physics collaborator and the
//! configuration, and drives every component from `tick`.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;

use crate::engine::state::{
    Anomaly, CommitRecord, EngineSnapshot, EngineState, HoverStone, Phase, PlacingStone,
};
use crate::features::FeatureVector;
use crate::geometry::{derive_params, Color, GeometryParams, StoneGeometry};
use crate::ledger::{Resync, StackLedger};
use crate::logging::{
    log, log_anomaly, log_commit, log_discard, log_loss, log_sample, log_settle, obj, v_num, v_str, Domain,
    Level, ProfileScope,
};
use crate::loss::{instant_misalignment, outward_impulse, select_most_recent, stones_to_lose};
use crate::morph::Snapshot;
use crate::physics::PhysicsWorld;
use crate::stance::{Stance, StanceChange};
use crate::state::Config;

/// What became of a commit request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Hover stone frozen into a placement
    Placing,
    /// Flat: hover stone dropped and replaced
    Discarded,
    /// Commit not allowed in the current phase
    Misfire,
    /// No hover stone to commit
    MissingHover,
}

pub struct Engine<P: PhysicsWorld> {
    cfg: Config,
    physics: P,
    state: EngineState,
}

impl<P: PhysicsWorld> Engine<P> {
    /// Build an engine and pre-populate the stack. The first `tick` prepares
    /// the first hover stone.
    pub fn new(cfg: Config, physics: P, now: u64) -> Self {
        let state = EngineState::new(cfg.ground_y, cfg.cadence_interval_ms(), cfg.initial_stance);
        let mut engine = Self { cfg, physics, state };
        engine.state.now = now;
        engine.prepopulate();
        log(
            Level::Info,
            Domain::System,
            "engine_ready",
            obj(&[
                ("stance", v_str(engine.state.stance.current().as_str())),
                ("committed_count", json!(engine.state.ledger.committed_count)),
                ("top_surface_y", v_num(engine.state.ledger.top_surface_y)),
                ("cadence_ms", json!(engine.state.scheduler.interval_ms())),
            ]),
        );
        engine
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn physics(&self) -> &P {
        &self.physics
    }

    pub fn physics_mut(&mut self) -> &mut P {
        &mut self.physics
    }

    pub fn phase(&self) -> Phase {
        self.state.phase
    }

    pub fn stance(&self) -> Stance {
        self.state.stance.current()
    }

    pub fn ledger(&self) -> &StackLedger {
        &self.state.ledger
    }

    pub fn digest(&self) -> String {
        self.state.digest()
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        let decision_progress = match self.state.phase {
            Phase::Hovering => self.state.scheduler.progress(self.state.now),
            _ => 0.0,
        };
        EngineSnapshot {
            phase: self.state.phase,
            stance: self.state.stance.current(),
            hover: self.state.hover.clone(),
            placing: self.state.placing.clone(),
            ledger: self.state.ledger,
            decision_progress,
            morph_progress: self.state.hover.as_ref().and_then(|h| h.transition_progress()),
            severity: self.state.severity.severity(),
        }
    }

    // =========================================================================
    // Inputs
    // =========================================================================

    /// Accept a feature sample. While hovering it becomes the new morph
    /// target unless the hover stone's update cap is spent.
    pub fn ingest(&mut self, fv: FeatureVector) {
        let fv = fv.clamped();
        self.state.counters.samples += 1;
        self.state.latest = Some(fv);
        log_sample(fv.timestamp, fv.momentum, fv.volatility, fv.order_imbalance, fv.direction().as_str());

        if self.state.phase != Phase::Hovering {
            return;
        }
        let (target, _) = self.target_snapshot(&fv);
        let duration = self.cfg.morph_duration_ms();
        let Some(hover) = self.state.hover.as_mut() else {
            return;
        };
        if hover.morph.retarget(target, duration) {
            hover.source = fv;
            hover.implied = fv.direction();
        } else {
            log(
                Level::Debug,
                Domain::Morph,
                "update_cap_reached",
                obj(&[("stone", json!(hover.id)), ("cap", json!(hover.morph.update_cap))]),
            );
        }
    }

    pub fn flip(&mut self) -> StanceChange {
        let change = self.state.stance.flip(self.state.phase);
        if let StanceChange::Flipped { to, .. } = change {
            if let Some(hover) = self.state.hover.as_mut() {
                hover.stance = to;
                hover.marked_for_discard = false;
                hover.refresh(self.cfg.stack_x);
            }
        }
        change
    }

    pub fn set_flat(&mut self) -> StanceChange {
        let change = self.state.stance.set_flat(self.state.phase);
        if change == StanceChange::MarkedFlat {
            if let Some(hover) = self.state.hover.as_mut() {
                hover.stance = Stance::Flat;
                hover.marked_for_discard = true;
                hover.refresh(self.cfg.stack_x);
            }
        }
        change
    }

    // =========================================================================
    // Tick
    // =========================================================================

    pub fn tick(&mut self, now: u64) {
        let _scope = ProfileScope::with_context("engine_tick", &[("phase", v_str(self.state.phase.as_str()))]);
        let dt = self.state.last_tick.map(|t| now.saturating_sub(t)).unwrap_or(0) as f64;
        self.state.last_tick = Some(now);
        self.state.now = now;
        self.state.counters.ticks += 1;

        if self.state.phase != Phase::Loss && self.state.ledger.committed_count > 0 {
            self.evaluate_alignment(now, dt);
        }

        if self.state.phase == Phase::Loss {
            self.physics.step(dt);
            if self.state.settle.fire(now) {
                self.settle_loss();
            }
        }

        if self.state.phase == Phase::Stable {
            self.enter_hovering(now);
        }

        match self.state.phase {
            Phase::Hovering => self.advance_hover(now, dt),
            Phase::Placing => self.advance_placement(dt),
            Phase::Stable | Phase::Loss => {}
        }
    }

    /// Freeze the hover stone into a placement, or drop it when flat.
    /// Called by the cadence scheduler; safe to call at any time.
    pub fn request_commit(&mut self, now: u64) -> CommitOutcome {
        let phase = self.state.phase;
        if phase != Phase::Hovering {
            self.record_anomaly(Anomaly::SchedulerMisfire, phase.as_str());
            if matches!(phase, Phase::Placing | Phase::Loss) {
                self.state.scheduler.suspend();
            }
            return CommitOutcome::Misfire;
        }
        let Some(mut hover) = self.state.hover.take() else {
            self.record_anomaly(Anomaly::MissingHoverStone, "commit");
            return CommitOutcome::MissingHover;
        };
        hover.morph.retire();

        let stance = self.state.stance.current();
        if hover.marked_for_discard || stance == Stance::Flat {
            self.state.counters.discards += 1;
            log_discard("flat", self.state.ledger.committed_count);
            self.prepare_hover(now);
            return CommitOutcome::Discarded;
        }

        let ledger = self.state.ledger;
        let geometry = StoneGeometry::build(&derive_params(&hover.source), ledger.top_orientation, hover.source.direction());
        if geometry.clamped {
            log_clamped(&derive_params(&hover.source));
            self.record_anomaly(Anomaly::DegenerateGeometry, "commit");
        }
        let placing = PlacingStone::new(
            hover.id,
            geometry,
            stance,
            hover.color(),
            hover.center,
            hover.rotation,
            self.cfg.stack_x,
            ledger.top_surface_y,
            self.cfg.placement_duration_ms(),
        );
        log(
            Level::Debug,
            Domain::Ledger,
            "placement_started",
            obj(&[
                ("stone", json!(placing.id)),
                ("stance", v_str(stance.as_str())),
                ("implied", v_str(placing.geometry.implied.as_str())),
                ("fit", json!(placing.fits())),
            ]),
        );
        self.state.scheduler.suspend();
        self.state.placing = Some(placing);
        self.state.phase = Phase::Placing;
        CommitOutcome::Placing
    }

    // =========================================================================
    // Phases
    // =========================================================================

    fn enter_hovering(&mut self, now: u64) {
        self.prepare_hover(now);
        self.state.phase = Phase::Hovering;
        self.state.scheduler.resume(now);
    }

    fn prepare_hover(&mut self, now: u64) {
        let fv = self.state.latest.unwrap_or_else(|| FeatureVector::neutral(now));
        let (initial, clamped) = self.target_snapshot(&fv);
        if clamped {
            log_clamped(&derive_params(&fv));
            self.record_anomaly(Anomaly::DegenerateGeometry, "hover");
        }
        let stance = self.state.stance.current();
        let id = self.state.take_stone_id();
        let mut hover = HoverStone::new(id, initial, fv, stance, self.cfg.morph_cap, self.cfg.stack_x);
        hover.marked_for_discard = stance == Stance::Flat;
        log(
            Level::Debug,
            Domain::Morph,
            "hover_ready",
            obj(&[("stone", json!(id)), ("stance", v_str(stance.as_str())), ("implied", v_str(hover.implied.as_str()))]),
        );
        self.state.hover = Some(hover);
    }

    fn advance_hover(&mut self, now: u64, dt: f64) {
        match self.state.hover.as_mut() {
            Some(hover) => {
                hover.morph.advance(dt);
                hover.refresh(self.cfg.stack_x);
            }
            None => {
                self.record_anomaly(Anomaly::MissingHoverStone, "hover_tick");
                self.prepare_hover(now);
            }
        }
        if self.state.scheduler.poll(now) {
            self.request_commit(now);
        }
    }

    fn advance_placement(&mut self, dt: f64) {
        let landed = match self.state.placing.as_mut() {
            Some(p) => p.advance(dt),
            None => {
                self.state.phase = Phase::Stable;
                return;
            }
        };
        if !landed {
            return;
        }
        let Some(stone) = self.state.placing.take() else {
            return;
        };

        let orientation = stone.geometry.rotation(stone.stance);
        self.physics.add_stone(
            &stone.geometry.polygon.vertices,
            &stone.geometry.params,
            stone.to_center.x,
            stone.to_center.y,
            stone.color,
            orientation,
        );
        self.state.ledger.commit_from_placement(&stone);

        let fit = stone.fits();
        let record = CommitRecord {
            id: stone.id,
            stance: stone.stance,
            implied: stone.geometry.implied,
            prev_orientation: stone.geometry.prev_orientation,
            bottom_angle: stone.target.bottom_angle,
            top_angle: stone.target.top_angle,
            top_surface_y: self.state.ledger.top_surface_y,
            fit,
        };
        self.state.record_commit(record);
        self.state.counters.commits += 1;
        log_commit(
            stone.id,
            stone.stance.as_str(),
            record.prev_orientation,
            record.bottom_angle,
            record.top_angle,
            fit,
        );
        self.state.phase = Phase::Stable;
    }

    // =========================================================================
    // Alignment and loss
    // =========================================================================

    fn evaluate_alignment(&mut self, now: u64, dt: f64) {
        let Some(fv) = self.state.latest else {
            return;
        };
        let lc = self.cfg.loss();
        let instant = instant_misalignment(&fv, self.state.stance.current(), &lc.weights);
        let severity = self.state.severity.update(instant, dt, &lc);
        if !self.state.severity.breached(&lc) {
            return;
        }
        let count = stones_to_lose(severity.max(instant), self.state.ledger.committed_count, &lc);
        if count > 0 {
            self.begin_loss(now, severity, count);
        }
    }

    fn begin_loss(&mut self, now: u64, severity: f64, count: usize) {
        let preempted = match (&self.state.placing, &self.state.hover) {
            (Some(_), _) => "placing",
            (None, Some(_)) => "hovering",
            (None, None) => "none",
        };
        self.state.scheduler.suspend();
        self.state.hover = None;
        self.state.placing = None;

        let targets = select_most_recent(self.physics.stones(), count);
        let stack_x = self.cfg.stack_x;
        let impulses: Vec<_> = targets
            .iter()
            .enumerate()
            .filter_map(|(rank, id)| {
                self.physics
                    .stones()
                    .iter()
                    .find(|b| b.id == *id)
                    .map(|b| (*id, outward_impulse(b, rank, stack_x, self.cfg.loss_impulse)))
            })
            .collect();
        for (id, impulse) in &impulses {
            self.physics.wake(*id);
            if let Some(body) = self.physics.stones_mut().iter_mut().find(|b| b.id == *id) {
                body.force += *impulse;
            }
        }

        log_loss(severity, targets.len(), self.state.ledger.committed_count, preempted);
        self.state.counters.loss_events += 1;
        self.state.counters.stones_lost += targets.len() as u64;
        self.state.pending_loss = targets;
        self.state.severity.reset();
        self.state.settle.arm(now + self.cfg.settle_delay_ms());
        self.state.phase = Phase::Loss;
    }

    fn settle_loss(&mut self) {
        let lost: Vec<_> = self.state.pending_loss.drain(..).collect();
        for id in &lost {
            // bodies that tumbled out of play are already gone
            self.physics.remove_stone(*id);
        }
        if self.state.ledger.recalculate_from_physics(&self.physics) == Resync::EmptyStack {
            self.record_anomaly(Anomaly::EmptyStack, "settle");
        }
        log_settle(self.state.ledger.top_surface_y, self.state.ledger.committed_count, lost.len());
        self.state.phase = Phase::Stable;
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// Morph target for a sample, fitted to the current top face.
    fn target_snapshot(&self, fv: &FeatureVector) -> (Snapshot, bool) {
        let ledger = &self.state.ledger;
        let geometry = StoneGeometry::build(&derive_params(fv), ledger.top_orientation, fv.direction());
        let (color, facet_strength, drift_x) = Snapshot::appearance(fv);
        let snapshot = Snapshot {
            params: geometry.params,
            color,
            facet_strength,
            drift_x,
            angle_long: geometry.angle_long,
            center_y: ledger.top_surface_y - self.cfg.hover_lift - geometry.params.height * 0.5,
        };
        (snapshot, geometry.clamped)
    }

    fn record_anomaly(&mut self, anomaly: Anomaly, detail: &str) {
        self.state.counters.anomalies.record(anomaly);
        log_anomaly(anomaly.as_str(), detail);
    }

    /// Seeded level stones, then a resync so the ledger matches physics.
    fn prepopulate(&mut self) {
        if self.cfg.prepopulate == 0 {
            return;
        }
        let mut rng = StdRng::seed_from_u64(self.cfg.seed);
        let mut top_y = self.cfg.ground_y;
        for _ in 0..self.cfg.prepopulate {
            let width: f64 = rng.gen_range(70.0..=130.0);
            let params = GeometryParams {
                base_width: width,
                height: width * rng.gen_range(0.7..=0.95),
                taper: rng.gen_range(0.0..=0.2),
                roundness: rng.gen_range(0.3..=0.9),
                bottom_angle_offset: 0.0,
                top_angle_offset: 0.0,
            };
            let geometry = StoneGeometry::build(&params, 0.0, Stance::Long);
            let center = geometry.landing_center(Stance::Long, self.cfg.stack_x, top_y);
            let shade = rng.gen_range(-0.08..=0.08);
            let color = Color { r: Color::STONE.r + shade, g: Color::STONE.g + shade, b: Color::STONE.b + shade };
            self.physics.add_stone(
                &geometry.polygon.vertices,
                &geometry.params,
                center.x,
                center.y,
                color,
                geometry.angle_long,
            );
            top_y = geometry.metrics(Stance::Long, center).top_midpoint.y;
        }
        self.state.ledger.recalculate_from_physics(&self.physics);
    }
}

fn log_clamped(raw: &GeometryParams) {
    log(
        Level::Debug,
        Domain::Geometry,
        "params_clamped",
        obj(&[
            ("base_width", v_num(raw.base_width)),
            ("height", v_num(raw.height)),
            ("taper", v_num(raw.taper)),
            ("bottom_angle_offset", v_num(raw.bottom_angle_offset)),
            ("top_angle_offset", v_num(raw.top_angle_offset)),
        ]),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physics::SandboxWorld;

    fn cfg(prepopulate: usize) -> Config {
        Config { prepopulate, ..Config::default() }
    }

    fn bullish(ts: u64) -> FeatureVector {
        FeatureVector {
            momentum: 0.8,
            volatility: 0.3,
            order_imbalance: 0.6,
            breadth: 0.5,
            volume: 0.5,
            timestamp: ts,
        }
    }

    fn engine(prepopulate: usize) -> Engine<SandboxWorld> {
        let c = cfg(prepopulate);
        let world = SandboxWorld::new(c.ground_y);
        Engine::new(c, world, 0)
    }

    #[test]
    fn test_prepopulate_matches_physics() {
        let e = engine(10);
        assert_eq!(e.ledger().committed_count, 10);
        assert_eq!(e.physics().len(), 10);
        assert_eq!(e.ledger().top_orientation, 0.0);
        assert!(e.ledger().top_surface_y < e.config().ground_y - 400.0);
        assert_eq!(e.phase(), Phase::Stable);
    }

    #[test]
    fn test_first_tick_prepares_hover() {
        let mut e = engine(0);
        e.tick(0);
        assert_eq!(e.phase(), Phase::Hovering);
        assert!(e.state().hover.is_some());
        assert_eq!(e.state().scheduler.next_fire_at(), Some(e.config().cadence_interval_ms()));
    }

    #[test]
    fn test_commit_places_and_lands() {
        let mut e = engine(0);
        e.ingest(bullish(0));
        e.tick(0);
        assert_eq!(e.request_commit(0), CommitOutcome::Placing);
        assert_eq!(e.phase(), Phase::Placing);
        assert!(e.state().scheduler.is_suspended());
        e.tick(200);
        assert_eq!(e.phase(), Phase::Placing);
        e.tick(500);
        assert_eq!(e.phase(), Phase::Stable);
        assert_eq!(e.ledger().committed_count, 1);
        assert_eq!(e.physics().len(), 1);
        assert!(e.state().history[0].fit);
        e.tick(516);
        assert_eq!(e.phase(), Phase::Hovering);
    }

    #[test]
    fn test_misfire_outside_hovering() {
        let mut e = engine(0);
        e.tick(0);
        e.request_commit(0);
        assert_eq!(e.request_commit(10), CommitOutcome::Misfire);
        assert_eq!(e.state().counters.anomalies.get(Anomaly::SchedulerMisfire), 1);
        assert_eq!(e.phase(), Phase::Placing);
    }

    #[test]
    fn test_flip_out_of_flat_clears_discard() {
        let mut e = engine(0);
        e.tick(0);
        e.set_flat();
        assert!(e.state().hover.as_ref().unwrap().marked_for_discard);
        e.flip();
        let hover = e.state().hover.as_ref().unwrap();
        assert!(!hover.marked_for_discard);
        assert_eq!(hover.stance, Stance::Long);
        assert_eq!(e.request_commit(0), CommitOutcome::Placing);
    }

    #[test]
    fn test_short_stance_mirrors_hover() {
        let mut e = engine(0);
        e.ingest(bullish(0));
        e.tick(0);
        let before = e.state().hover.as_ref().unwrap().rotation;
        e.flip();
        let after = e.state().hover.as_ref().unwrap().rotation;
        let d = crate::geometry::shortest_delta(before, after).abs();
        assert!((d - std::f64::consts::PI).abs() < 1e-9);
    }

    #[test]
    fn test_snapshot_progress() {
        let mut e = engine(0);
        e.tick(0);
        e.tick(2000);
        let snap = e.snapshot();
        assert_eq!(snap.phase, Phase::Hovering);
        assert!((snap.decision_progress - 0.5).abs() < 1e-9);
        assert!(snap.placing.is_none());
        assert_eq!(snap.morph_progress, None);
    }

    #[test]
    fn test_snapshot_reports_morph_progress() {
        let mut e = engine(0);
        e.tick(0);
        e.ingest(bullish(0));
        e.tick(100);
        let p = e.snapshot().morph_progress.expect("morph in flight");
        assert!(p > 0.0 && p < 1.0, "progress {}", p);

        e.tick(1000);
        assert_eq!(e.snapshot().morph_progress, None);
    }

    #[test]
    fn test_commit_without_hover_is_absorbed() {
        let mut e = engine(0);
        e.tick(0);
        assert_eq!(e.phase(), Phase::Hovering);
        e.state.hover = None;

        assert_eq!(e.request_commit(0), CommitOutcome::MissingHover);
        assert_eq!(e.state().counters.anomalies.get(Anomaly::MissingHoverStone), 1);
        assert_eq!(e.phase(), Phase::Hovering);
        assert!(e.state().hover.is_none());

        e.tick(16);
        assert_eq!(e.state().counters.anomalies.get(Anomaly::MissingHoverStone), 2);
        assert!(e.state().hover.is_some(), "next tick prepares a hover stone");
        assert_eq!(e.state().counters.commits, 0);
    }

    #[test]
    fn test_settling_tick_goes_straight_to_hover() {
        let mut e = engine(10);
        e.ingest(FeatureVector {
            momentum: -0.9,
            volatility: 0.4,
            order_imbalance: -0.7,
            breadth: 0.5,
            volume: 0.5,
            timestamp: 0,
        });
        let mut now = 0;
        while e.phase() != Phase::Loss && now < 10_000 {
            e.tick(now);
            now += 16;
        }
        assert_eq!(e.phase(), Phase::Loss);

        while e.phase() == Phase::Loss && now < 20_000 {
            now += 16;
            e.tick(now);
            if e.phase() == Phase::Loss {
                assert!(e.state().hover.is_none());
            }
        }
        // the settling tick also entered hovering and prepared the stone
        assert_eq!(e.phase(), Phase::Hovering);
        assert!(e.state().hover.is_some());
        assert!(e.ledger().committed_count < 10);
        assert!(!e.state().scheduler.is_suspended());
    }
}
