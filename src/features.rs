//! Feature samples and the sources that produce them.
//!
//! The engine treats a [`FeatureVector`] as an opaque bounded sample: it only
//! looks at signs and magnitudes. Sources are pull-based and must hand out
//! samples with increasing timestamps.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::logging::{log, obj, v_str, Domain, Level};
use crate::stance::Stance;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    /// Signed trend strength, [-1, 1]
    pub momentum: f64,
    /// [0, 1]
    pub volatility: f64,
    /// Signed bid/ask pressure, [-1, 1]
    pub order_imbalance: f64,
    /// [0, 1]
    pub breadth: f64,
    /// [0, 1]
    pub volume: f64,
    /// Sample time, ms
    pub timestamp: u64,
}

fn finite_or_zero(x: f64) -> f64 {
    if x.is_finite() { x } else { 0.0 }
}

impl FeatureVector {
    pub fn neutral(timestamp: u64) -> Self {
        Self { momentum: 0.0, volatility: 0.2, order_imbalance: 0.0, breadth: 0.5, volume: 0.5, timestamp }
    }

    /// Copy with every field forced into its bounds.
    pub fn clamped(&self) -> Self {
        Self {
            momentum: finite_or_zero(self.momentum).clamp(-1.0, 1.0),
            volatility: finite_or_zero(self.volatility).clamp(0.0, 1.0),
            order_imbalance: finite_or_zero(self.order_imbalance).clamp(-1.0, 1.0),
            breadth: finite_or_zero(self.breadth).clamp(0.0, 1.0),
            volume: finite_or_zero(self.volume).clamp(0.0, 1.0),
            timestamp: self.timestamp,
        }
    }

    /// Signed direction score in [-1, 1]
    pub fn direction_score(&self) -> f64 {
        let f = self.clamped();
        ((f.momentum + 0.5 * f.order_imbalance) / 1.5).clamp(-1.0, 1.0)
    }

    /// Stance the features imply. Ties go long.
    pub fn direction(&self) -> Stance {
        if self.direction_score() >= 0.0 { Stance::Long } else { Stance::Short }
    }
}

/// Pull-based feature source. Retry and backoff are the source's concern.
pub trait FeatureSource {
    fn next(&mut self) -> Option<FeatureVector>;
}

// =============================================================================
// Scripted replay
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct ScriptedSource {
    samples: VecDeque<FeatureVector>,
}

impl ScriptedSource {
    pub fn new(samples: Vec<FeatureVector>) -> Self {
        Self { samples: samples.into() }
    }

    pub fn remaining(&self) -> usize {
        self.samples.len()
    }
}

impl FeatureSource for ScriptedSource {
    fn next(&mut self) -> Option<FeatureVector> {
        self.samples.pop_front()
    }
}

// =============================================================================
// Random walk
// =============================================================================

#[derive(Debug, Clone)]
pub struct RollingStats {
    window: usize,
    buf: VecDeque<f64>,
    sum: f64,
    sumsq: f64,
}

impl RollingStats {
    pub fn new(window: usize) -> Self {
        Self { window: window.max(1), buf: VecDeque::new(), sum: 0.0, sumsq: 0.0 }
    }

    pub fn push(&mut self, x: f64) {
        self.buf.push_back(x);
        self.sum += x;
        self.sumsq += x * x;
        if self.buf.len() > self.window {
            if let Some(old) = self.buf.pop_front() {
                self.sum -= old;
                self.sumsq -= old * old;
            }
        }
    }

    pub fn mean(&self) -> f64 {
        if self.buf.is_empty() { 0.0 } else { self.sum / self.buf.len() as f64 }
    }

    pub fn variance(&self) -> f64 {
        let n = self.buf.len() as f64;
        if n < 2.0 { 0.0 } else { ((self.sumsq - (self.sum * self.sum) / n) / (n - 1.0)).max(0.0) }
    }

    pub fn stddev(&self) -> f64 {
        self.variance().sqrt()
    }
}

/// Mean-reverting random walk. Volatility is the rolling stddev of momentum
/// changes, rescaled into [0, 1].
#[derive(Debug, Clone)]
pub struct RandomWalkSource {
    rng: StdRng,
    momentum: f64,
    imbalance: f64,
    breadth: f64,
    changes: RollingStats,
    ts: u64,
    step_ms: u64,
}

impl RandomWalkSource {
    pub fn new(seed: u64, step_ms: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            momentum: 0.0,
            imbalance: 0.0,
            breadth: 0.5,
            changes: RollingStats::new(20),
            ts: 0,
            step_ms: step_ms.max(1),
        }
    }
}

impl FeatureSource for RandomWalkSource {
    fn next(&mut self) -> Option<FeatureVector> {
        let shock: f64 = self.rng.gen_range(-0.25..=0.25);
        let prev = self.momentum;
        self.momentum = (self.momentum * 0.9 + shock).clamp(-1.0, 1.0);
        self.changes.push(self.momentum - prev);

        let flow: f64 = self.rng.gen_range(-0.3..=0.3);
        self.imbalance = (0.6 * self.imbalance + 0.3 * self.momentum + flow).clamp(-1.0, 1.0);
        let drift: f64 = self.rng.gen_range(-0.05..=0.05);
        self.breadth = (self.breadth + drift).clamp(0.0, 1.0);

        self.ts += self.step_ms;
        Some(
            FeatureVector {
                momentum: self.momentum,
                volatility: self.changes.stddev() * 4.0,
                order_imbalance: self.imbalance,
                breadth: self.breadth,
                volume: 0.3 + 0.7 * self.momentum.abs().max(self.imbalance.abs()),
                timestamp: self.ts,
            }
            .clamped(),
        )
    }
}

// =============================================================================
// CSV replay
// =============================================================================

pub const CSV_COLUMNS: [&str; 6] = ["ts", "momentum", "volatility", "order_imbalance", "breadth", "volume"];

/// Parse `ts,momentum,volatility,order_imbalance,breadth,volume`.
pub fn parse_feature_line(line: &str) -> Result<FeatureVector> {
    let parts: Vec<&str> = line.split(',').map(|p| p.trim()).collect();
    if parts.len() != CSV_COLUMNS.len() {
        return Err(anyhow!("expected {} columns, got {}", CSV_COLUMNS.len(), parts.len()));
    }
    let num = |i: usize| -> Result<f64> {
        parts[i]
            .parse::<f64>()
            .with_context(|| format!("column {} ({})", CSV_COLUMNS[i], parts[i]))
    };
    Ok(FeatureVector {
        timestamp: parts[0].parse::<u64>().with_context(|| format!("column ts ({})", parts[0]))?,
        momentum: num(1)?,
        volatility: num(2)?,
        order_imbalance: num(3)?,
        breadth: num(4)?,
        volume: num(5)?,
    }
    .clamped())
}

#[derive(Debug, Clone)]
pub struct CsvSource {
    inner: ScriptedSource,
}

impl CsvSource {
    /// Load every valid row. Malformed and out-of-order rows are skipped with
    /// a warning.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
        let mut samples: Vec<FeatureVector> = Vec::new();
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.to_lowercase().starts_with("ts,") {
                continue;
            }
            match parse_feature_line(trimmed) {
                Ok(fv) if samples.last().map_or(true, |last| fv.timestamp > last.timestamp) => samples.push(fv),
                Ok(_) => warn_row(lineno + 1, "timestamp not increasing"),
                Err(err) => warn_row(lineno + 1, &format!("{:#}", err)),
            }
        }
        Ok(Self { inner: ScriptedSource::new(samples) })
    }

    pub fn remaining(&self) -> usize {
        self.inner.remaining()
    }
}

fn warn_row(line: usize, reason: &str) {
    log(
        Level::Warn,
        Domain::Feature,
        "csv_row_skipped",
        obj(&[("line", serde_json::json!(line)), ("msg", v_str(reason))]),
    );
}

impl FeatureSource for CsvSource {
    fn next(&mut self) -> Option<FeatureVector> {
        self.inner.next()
    }
}
