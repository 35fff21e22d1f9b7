//! Deterministic offline session.
//!
//! Drives the engine on a virtual clock with a seeded feature source and a
//! seeded operator who mostly follows the market. Same config, same digest.
//!
//! Usage: simulate [duration_ms]
//! Env: every engine variable (see `Config::from_env`), plus FOLLOW_RATE and
//! FLAT_RATE for the simulated operator.

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;

use stancestack::engine::{Engine, Phase};
use stancestack::features::{CsvSource, FeatureSource, RandomWalkSource};
use stancestack::logging::{log_session_summary, ProfileScope};
use stancestack::physics::SandboxWorld;
use stancestack::state::Config;

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn main() -> Result<()> {
    let duration_ms: u64 = match std::env::args().nth(1) {
        Some(arg) => arg.parse().with_context(|| format!("bad duration: {}", arg))?,
        None => 120_000,
    };
    let cfg = Config::from_env();
    cfg.validate()?;
    let follow_rate = env_f64("FOLLOW_RATE", 0.7).clamp(0.0, 1.0);
    let flat_rate = env_f64("FLAT_RATE", 0.05).clamp(0.0, 1.0);

    let mut source: Box<dyn FeatureSource> = match &cfg.feature_csv {
        Some(path) => Box::new(CsvSource::open(path)?),
        None => Box::new(RandomWalkSource::new(cfg.seed, cfg.sample_ms)),
    };
    let mut operator = StdRng::seed_from_u64(cfg.seed ^ 0x5eed);

    let world = SandboxWorld::new(cfg.ground_y);
    let mut engine = Engine::new(cfg.clone(), world, 0);
    let mut next_sample = 0u64;
    let mut flips = 0u64;
    let mut flats = 0u64;
    let mut max_height = engine.ledger().committed_count;

    let _scope = ProfileScope::with_context("simulate", &[("duration_ms", json!(duration_ms))]);
    let mut now = 0u64;
    while now <= duration_ms {
        if now >= next_sample {
            next_sample += cfg.sample_ms;
            if let Some(fv) = source.next() {
                engine.ingest(fv);
                // Operator reacts once per sample, only while a stone hovers
                if engine.phase() == Phase::Hovering {
                    let r: f64 = operator.gen();
                    if r < flat_rate {
                        engine.set_flat();
                        flats += 1;
                    } else if engine.stance() != fv.direction() && operator.gen_bool(follow_rate) {
                        engine.flip();
                        flips += 1;
                    }
                }
            }
        }
        engine.tick(now);
        max_height = max_height.max(engine.ledger().committed_count);
        now += cfg.tick_ms;
    }

    let state = engine.state();
    let c = state.counters;
    let fits = state.history.iter().filter(|r| r.fit).count();
    let digest = engine.digest();
    log_session_summary(c.ticks, c.commits, c.discards, c.loss_events, c.stones_lost, &digest);

    let summary = json!({
        "duration_ms": duration_ms,
        "seed": cfg.seed,
        "ticks": c.ticks,
        "samples": c.samples,
        "commits": c.commits,
        "fits": fits,
        "discards": c.discards,
        "loss_events": c.loss_events,
        "stones_lost": c.stones_lost,
        "operator": { "flips": flips, "flats": flats },
        "anomalies": c.anomalies,
        "final": {
            "phase": engine.phase().as_str(),
            "stance": engine.stance().as_str(),
            "committed_count": engine.ledger().committed_count,
            "max_height": max_height,
            "top_surface_y": engine.ledger().top_surface_y,
            "top_orientation": engine.ledger().top_orientation,
        },
        "digest": digest,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
