//! Structured logging for the stacking engine.
//!
//! Design goals:
//! 1. Multi-level granularity (TRACE → FATAL)
//! 2. Domain categories per engine component for filtering
//! 3. Replay support via sequence numbers and state digests
//! 4. One JSON object per line, mirrored to per-run files

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fs::{create_dir_all, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

// =============================================================================
// Log Levels
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Fatal = 5,
}

impl Level {
    pub fn from_env() -> Self {
        match std::env::var("LOG_LEVEL").as_deref() {
            Ok("trace") => Level::Trace,
            Ok("debug") => Level::Debug,
            Ok("info") => Level::Info,
            Ok("warn") => Level::Warn,
            Ok("error") => Level::Error,
            Ok("fatal") => Level::Fatal,
            _ => Level::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Fatal => "fatal",
        }
    }
}

// =============================================================================
// Log Domains (one per engine component)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Feature,  // Incoming samples, source health
    Geometry, // Stone construction, clamping
    Stance,   // Operator commands
    Morph,    // Hover transitions
    Cadence,  // Commit scheduling
    Ledger,   // Stack reference frame updates
    Loss,     // Severity and loss events
    Physics,  // Collaborator calls
    System,   // Startup, shutdown
    Profile,  // Tick timing
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Feature => "feature",
            Domain::Geometry => "geometry",
            Domain::Stance => "stance",
            Domain::Morph => "morph",
            Domain::Cadence => "cadence",
            Domain::Ledger => "ledger",
            Domain::Loss => "loss",
            Domain::Physics => "physics",
            Domain::System => "system",
            Domain::Profile => "profile",
        }
    }

    pub fn is_enabled(&self) -> bool {
        // LOG_DOMAINS: comma-separated list or "all"
        match std::env::var("LOG_DOMAINS").as_deref() {
            Ok("all") | Err(_) => true,
            Ok(domains) => domains.split(',').any(|d| d.trim() == self.as_str()),
        }
    }
}

// =============================================================================
// Echo target
// =============================================================================

/// Where log lines are mirrored besides the per-run files. Stdout is kept
/// free for program output unless asked for explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Echo {
    Stdout,
    Stderr,
    Off,
}

impl Echo {
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            Some("stdout") => Echo::Stdout,
            Some("off") | Some("0") | Some("false") | Some("none") => Echo::Off,
            _ => Echo::Stderr,
        }
    }

    pub fn from_env() -> Self {
        Self::parse(std::env::var("LOG_ECHO").ok().as_deref())
    }
}

// =============================================================================
// Run context
// =============================================================================

static LOG_SEQ: AtomicU64 = AtomicU64::new(0);
static PROFILE_SEQ: AtomicU64 = AtomicU64::new(0);
static RUN_CONTEXT: OnceLock<RunContext> = OnceLock::new();

fn next_seq() -> u64 {
    LOG_SEQ.fetch_add(1, Ordering::SeqCst)
}

#[derive(Debug)]
struct RunContext {
    run_id: String,
    min_level: Level,
    echo: Echo,
    events: Option<Mutex<BufWriter<File>>>,
    trace: Option<Mutex<BufWriter<File>>>,
}

fn open_sink(path: PathBuf) -> Option<Mutex<BufWriter<File>>> {
    match File::create(&path) {
        Ok(file) => Some(Mutex::new(BufWriter::new(file))),
        Err(err) => {
            eprintln!("[log] failed to create {}: {}", path.display(), err);
            None
        }
    }
}

fn ensure_run_context() -> &'static RunContext {
    RUN_CONTEXT.get_or_init(|| {
        let run_id = std::env::var("RUN_ID")
            .unwrap_or_else(|_| format!("s-{}-{}", ts_epoch_ms(), process::id()));

        // LOG_DIR unset keeps logs on the echo only
        let (events, trace) = match std::env::var("LOG_DIR") {
            Ok(base) if !base.is_empty() => {
                let mut run_dir = PathBuf::from(base);
                run_dir.push(&run_id);
                if let Err(err) = create_dir_all(&run_dir) {
                    eprintln!("[log] failed to create run dir: {}", err);
                }
                let _ = std::fs::write(
                    run_dir.join("manifest.json"),
                    json!({
                        "run_id": run_id,
                        "ts": ts_now(),
                        "pid": process::id(),
                        "log_dir": run_dir.to_string_lossy(),
                    })
                    .to_string(),
                );
                (
                    open_sink(run_dir.join("events.jsonl")),
                    open_sink(run_dir.join("trace.jsonl")),
                )
            }
            _ => (None, None),
        };

        RunContext {
            run_id,
            min_level: Level::from_env(),
            echo: Echo::from_env(),
            events,
            trace,
        }
    })
}

fn write_line(writer: &Option<Mutex<BufWriter<File>>>, line: &str) {
    if let Some(writer) = writer {
        if let Ok(mut w) = writer.lock() {
            let _ = writeln!(w, "{}", line);
            let _ = w.flush();
        }
    }
}

// =============================================================================
// Core logging functions
// =============================================================================

/// RFC3339 timestamp with milliseconds
pub fn ts_now() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Epoch milliseconds
pub fn ts_epoch_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

/// Emit a structured log entry
pub fn log(level: Level, domain: Domain, event: &str, fields: Map<String, Value>) {
    let ctx = ensure_run_context();
    if level < ctx.min_level || !domain.is_enabled() {
        return;
    }
    emit_record(ctx, level, domain.as_str(), event, fields);
}

fn emit_record(ctx: &RunContext, level: Level, component: &str, event: &str, mut fields: Map<String, Value>) {
    let msg = fields.remove("msg").unwrap_or(Value::String(String::new()));
    let mut entry = Map::new();
    entry.insert("ts".to_string(), json!(ts_now()));
    entry.insert("run_id".to_string(), json!(ctx.run_id.clone()));
    entry.insert("seq".to_string(), json!(next_seq()));
    entry.insert("lvl".to_string(), json!(level.as_str().to_uppercase()));
    entry.insert("component".to_string(), json!(component));
    entry.insert("event".to_string(), json!(event));
    entry.insert("msg".to_string(), msg);
    entry.insert("data".to_string(), Value::Object(fields));

    let line = Value::Object(entry).to_string();
    match level {
        Level::Trace | Level::Debug => write_line(&ctx.trace, &line),
        _ => write_line(&ctx.events, &line),
    }
    match ctx.echo {
        Echo::Stdout => println!("{}", line),
        Echo::Stderr => eprintln!("{}", line),
        Echo::Off => {}
    }
}

// =============================================================================
// Domain-Specific Logging Helpers
// =============================================================================

pub fn log_sample(ts: u64, momentum: f64, volatility: f64, order_imbalance: f64, direction: &str) {
    log(
        Level::Trace,
        Domain::Feature,
        "sample",
        obj(&[
            ("sample_ts", json!(ts)),
            ("momentum", v_num(momentum)),
            ("volatility", v_num(volatility)),
            ("order_imbalance", v_num(order_imbalance)),
            ("direction", v_str(direction)),
        ]),
    );
}

pub fn log_stance(command: &str, from: &str, to: &str, applied: bool) {
    log(
        Level::Info,
        Domain::Stance,
        "command",
        obj(&[
            ("command", v_str(command)),
            ("from", v_str(from)),
            ("to", v_str(to)),
            ("applied", json!(applied)),
        ]),
    );
}

pub fn log_commit(seq: u64, stance: &str, prev_orientation: f64, bottom_angle: f64, top_angle: f64, fit: bool) {
    log(
        Level::Info,
        Domain::Ledger,
        "commit",
        obj(&[
            ("stone_seq", json!(seq)),
            ("stance", v_str(stance)),
            ("prev_orientation_deg", v_num(prev_orientation.to_degrees())),
            ("bottom_angle_deg", v_num(bottom_angle.to_degrees())),
            ("top_angle_deg", v_num(top_angle.to_degrees())),
            ("fit", json!(fit)),
        ]),
    );
}

pub fn log_discard(reason: &str, committed_count: usize) {
    log(
        Level::Info,
        Domain::Cadence,
        "discard",
        obj(&[
            ("reason", v_str(reason)),
            ("committed_count", json!(committed_count)),
        ]),
    );
}

pub fn log_loss(severity: f64, count: usize, height: usize, preempted: &str) {
    log(
        Level::Warn,
        Domain::Loss,
        "loss_event",
        obj(&[
            ("severity", v_num(severity)),
            ("stones", json!(count)),
            ("height", json!(height)),
            ("preempted", v_str(preempted)),
        ]),
    );
}

pub fn log_settle(top_surface_y: f64, committed_count: usize, removed: usize) {
    log(
        Level::Info,
        Domain::Ledger,
        "settle",
        obj(&[
            ("top_surface_y", v_num(top_surface_y)),
            ("committed_count", json!(committed_count)),
            ("removed", json!(removed)),
        ]),
    );
}

pub fn log_anomaly(kind: &str, detail: &str) {
    log(
        Level::Warn,
        Domain::System,
        "anomaly",
        obj(&[("kind", v_str(kind)), ("msg", v_str(detail))]),
    );
}

pub fn log_session_summary(ticks: u64, commits: u64, discards: u64, losses: u64, stones_lost: u64, digest: &str) {
    log(
        Level::Info,
        Domain::System,
        "session_summary",
        obj(&[
            ("ticks", json!(ticks)),
            ("commits", json!(commits)),
            ("discards", json!(discards)),
            ("loss_events", json!(losses)),
            ("stones_lost", json!(stones_lost)),
            ("digest", v_str(digest)),
        ]),
    );
}

// =============================================================================
// Utility Functions
// =============================================================================

pub fn obj(pairs: &[(&str, Value)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (k, v) in pairs {
        map.insert((*k).to_string(), v.clone());
    }
    map
}

pub fn v_str(s: &str) -> Value {
    Value::String(s.to_string())
}

pub fn v_num(n: f64) -> Value {
    json!(n)
}

// =============================================================================
// Profiling Scope
// =============================================================================

/// Profiling scope that emits structured timing on drop.
pub struct ProfileScope {
    label: &'static str,
    context: Option<Map<String, Value>>,
    started: Instant,
    enabled: bool,
}

impl ProfileScope {
    pub fn with_context(label: &'static str, fields: &[(&str, Value)]) -> Self {
        let enabled = Self::should_sample();
        Self {
            label,
            context: if enabled { Some(obj(fields)) } else { None },
            started: Instant::now(),
            enabled,
        }
    }

    fn should_sample() -> bool {
        std::env::var("PROFILE_SAMPLE")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
            .map(|p| {
                if p >= 1.0 {
                    true
                } else if p <= 0.0 {
                    false
                } else {
                    let seq = PROFILE_SEQ.fetch_add(1, Ordering::SeqCst);
                    let bucket = (seq % 10_000) as f64 / 10_000.0;
                    bucket < p
                }
            })
            // ticks are hot; off unless asked for
            .unwrap_or(false)
    }
}

impl Drop for ProfileScope {
    fn drop(&mut self) {
        if !self.enabled {
            return;
        }
        let elapsed_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        let mut fields = self.context.take().unwrap_or_default();
        fields.insert("label".to_string(), v_str(self.label));
        fields.insert("elapsed_ms".to_string(), v_num(elapsed_ms));
        log(Level::Trace, Domain::Profile, "profile", fields);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(Level::Trace < Level::Debug);
        assert!(Level::Debug < Level::Info);
        assert!(Level::Info < Level::Warn);
        assert!(Level::Warn < Level::Error);
        assert!(Level::Error < Level::Fatal);
    }

    #[test]
    fn test_obj_helper() {
        let m = obj(&[("key", v_str("value")), ("num", v_num(42.0))]);
        assert_eq!(m.get("key").unwrap(), "value");
        assert_eq!(m.get("num").unwrap(), 42.0);
    }

    #[test]
    fn test_domain_names_unique() {
        let all = [
            Domain::Feature,
            Domain::Geometry,
            Domain::Stance,
            Domain::Morph,
            Domain::Cadence,
            Domain::Ledger,
            Domain::Loss,
            Domain::Physics,
            Domain::System,
            Domain::Profile,
        ];
        let mut names: Vec<_> = all.iter().map(|d| d.as_str()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), all.len());
    }

    #[test]
    fn test_echo_defaults_to_stderr() {
        assert_eq!(Echo::parse(None), Echo::Stderr);
        assert_eq!(Echo::parse(Some("")), Echo::Stderr);
        assert_eq!(Echo::parse(Some("STDOUT")), Echo::Stdout);
        assert_eq!(Echo::parse(Some("off")), Echo::Off);
        assert_eq!(Echo::parse(Some("0")), Echo::Off);
    }

    #[test]
    fn test_seq_increments() {
        let s1 = next_seq();
        let s2 = next_seq();
        assert!(s2 > s1);
    }
}
