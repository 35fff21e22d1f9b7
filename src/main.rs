use anyhow::Result;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};

use stancestack::engine::Engine;
use stancestack::features::{CsvSource, FeatureSource, RandomWalkSource};
use stancestack::logging::{log, log_session_summary, obj, v_num, v_str, Domain, Level};
use stancestack::physics::SandboxWorld;
use stancestack::stance::StanceChange;
use stancestack::state::Config;

enum Command {
    Flip,
    Flat,
    Snapshot,
    Quit,
}

fn parse_command(line: &str) -> Option<Command> {
    match line.trim().to_ascii_lowercase().as_str() {
        "f" | "flip" => Some(Command::Flip),
        "x" | "flat" => Some(Command::Flat),
        "s" | "snap" => Some(Command::Snapshot),
        "q" | "quit" => Some(Command::Quit),
        _ => None,
    }
}

fn open_source(cfg: &Config) -> Result<Box<dyn FeatureSource + Send>> {
    match &cfg.feature_csv {
        Some(path) => {
            let src = CsvSource::open(path)?;
            log(
                Level::Info,
                Domain::Feature,
                "source",
                obj(&[("type", v_str("csv")), ("path", v_str(path)), ("rows", json!(src.remaining()))]),
            );
            Ok(Box::new(src))
        }
        None => {
            log(
                Level::Info,
                Domain::Feature,
                "source",
                obj(&[("type", v_str("random_walk")), ("seed", json!(cfg.seed))]),
            );
            Ok(Box::new(RandomWalkSource::new(cfg.seed, cfg.sample_ms)))
        }
    }
}

fn report_change(command: &str, change: StanceChange) {
    if change == StanceChange::Ignored {
        eprintln!("[{}] ignored: commands only apply while a stone is hovering", command);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();
    cfg.validate()?;
    let mut source = open_source(&cfg)?;

    let started = Instant::now();
    let clock = || started.elapsed().as_millis() as u64;

    let mut ticker = interval(Duration::from_millis(cfg.tick_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut sampler = interval(Duration::from_millis(cfg.sample_ms));
    sampler.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let world = SandboxWorld::new(cfg.ground_y);
    let mut engine = Engine::new(cfg.clone(), world, clock());
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut exhausted = false;

    eprintln!("commands: f/flip, x/flat, s/snap, q/quit");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                engine.tick(clock());
            }
            _ = sampler.tick() => {
                match source.next() {
                    Some(fv) => engine.ingest(fv),
                    None if !exhausted => {
                        exhausted = true;
                        log(Level::Warn, Domain::Feature, "source_exhausted", obj(&[("msg", v_str("holding last sample"))]));
                    }
                    None => {}
                }
            }
            line = stdin.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                match parse_command(&line) {
                    Some(Command::Flip) => report_change("flip", engine.flip()),
                    Some(Command::Flat) => report_change("flat", engine.set_flat()),
                    Some(Command::Snapshot) => {
                        println!("{}", serde_json::to_string(&engine.snapshot())?);
                    }
                    Some(Command::Quit) => break,
                    None => {
                        log(Level::Debug, Domain::System, "unknown_command", obj(&[("input", v_str(line.trim()))]));
                    }
                }
            }
        }
    }

    let c = engine.state().counters;
    log(
        Level::Info,
        Domain::System,
        "shutdown",
        obj(&[
            ("uptime_ms", json!(clock())),
            ("committed_count", json!(engine.ledger().committed_count)),
            ("top_surface_y", v_num(engine.ledger().top_surface_y)),
        ]),
    );
    log_session_summary(c.ticks, c.commits, c.discards, c.loss_events, c.stones_lost, &engine.digest());
    Ok(())
}
