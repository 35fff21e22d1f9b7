//! CSV feature replay.
//!
//! Files written to a temp dir and read back through `CsvSource`, then fed
//! to a live engine to make sure replayed samples reach the hover stone.

use std::fs;

use stancestack::engine::{Engine, Phase};
use stancestack::features::{CsvSource, FeatureSource};
use stancestack::physics::SandboxWorld;
use stancestack::stance::Stance;
use stancestack::state::Config;
use tempfile::TempDir;

fn write_csv(dir: &TempDir, name: &str, body: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, body).expect("write csv");
    path
}

#[test]
fn csv_skips_header_comments_and_bad_rows() {
    let dir = TempDir::new().unwrap();
    let path = write_csv(
        &dir,
        "features.csv",
        "ts,momentum,volatility,order_imbalance,breadth,volume\n\
         # warmup\n\
         1000,0.5,0.2,0.1,0.5,0.6\n\
         2000,oops,0.2,0.1,0.5,0.6\n\
         3000,-0.4,0.3,-0.6,0.4,0.5\n\
         2500,0.1,0.1,0.1,0.1,0.1\n\
         4000,0.2,0.1\n\
         \n\
         5000,2.0,0.9,0.0,0.5,0.5\n",
    );

    let mut src = CsvSource::open(&path).unwrap();
    assert_eq!(src.remaining(), 3);

    let a = src.next().unwrap();
    assert_eq!(a.timestamp, 1000);
    assert_eq!(a.direction(), Stance::Long);

    let b = src.next().unwrap();
    assert_eq!(b.timestamp, 3000);
    assert_eq!(b.direction(), Stance::Short);

    let c = src.next().unwrap();
    assert_eq!(c.timestamp, 5000);
    assert_eq!(c.momentum, 1.0, "out-of-range values are clamped");

    assert!(src.next().is_none());
}

#[test]
fn csv_missing_file_is_an_error() {
    let dir = TempDir::new().unwrap();
    let err = CsvSource::open(dir.path().join("nope.csv")).err().expect("should fail");
    assert!(format!("{:#}", err).contains("nope.csv"));
}

#[test]
fn csv_replay_drives_hover_morph() {
    let dir = TempDir::new().unwrap();
    let path = write_csv(
        &dir,
        "replay.csv",
        "1000,0.6,0.2,0.4,0.5,0.5\n\
         2000,0.7,0.3,0.5,0.6,0.4\n\
         3000,0.8,0.2,0.6,0.5,0.7\n",
    );
    let mut src = CsvSource::open(&path).unwrap();

    let cfg = Config { prepopulate: 2, ..Config::default() };
    let mut engine = Engine::new(cfg.clone(), SandboxWorld::new(cfg.ground_y), 0);
    engine.tick(0);
    assert_eq!(engine.phase(), Phase::Hovering);

    let mut now = 0;
    while let Some(fv) = src.next() {
        engine.ingest(fv);
        for _ in 0..10 {
            now += cfg.tick_ms;
            engine.tick(now);
        }
    }
    let hover = engine.state().hover.as_ref().expect("hovering");
    assert_eq!(hover.morph.updates_applied, 3);
    assert_eq!(hover.source.timestamp, 3000);
    assert_eq!(engine.state().counters.samples, 3);
}
