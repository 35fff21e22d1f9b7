//! Procedural stone construction.
//!
//! Screen convention: x grows right, y grows down, angles from `atan2` in that
//! frame. A face angle is the angle of its left-to-right edge and is only
//! meaningful modulo π, so face angles live in (-π/2, π/2].
//!
//! Every stone has one local vertex set. The long rendering is upright; the
//! short rendering is the same polygon turned by π, which puts the local top
//! face on the bottom. `build` rotates whichever rendering the features imply
//! so its bottom face lies exactly on the previous top face.

use std::f64::consts::PI;

pub use glam::DVec2;
use serde::{Deserialize, Serialize};

use crate::features::FeatureVector;
use crate::stance::Stance;

/// Per-face tilt limit, relative to the stone body
pub const MAX_OFFSET: f64 = PI / 6.0;
/// Limit on the world angle of a fitted top face
pub const MAX_TOP_TILT: f64 = PI / 4.0;
/// height >= MIN_ASPECT * base_width keeps tilted faces from crossing
pub const MIN_ASPECT: f64 = 0.65;
pub const MIN_WIDTH: f64 = 40.0;
pub const MAX_WIDTH: f64 = 160.0;
pub const MAX_HEIGHT: f64 = 140.0;
pub const MAX_TAPER: f64 = 0.6;
const SIDE_SEGMENTS: usize = 4;
const BULGE: f64 = 0.12;

// =============================================================================
// Angles
// =============================================================================

/// Wrap into (-π, π]
pub fn wrap_angle(a: f64) -> f64 {
    let tau = 2.0 * PI;
    let w = a - tau * (a / tau).round();
    if w <= -PI { w + tau } else { w }
}

/// Wrap a face (line) angle into (-π/2, π/2]
pub fn wrap_face(a: f64) -> f64 {
    let w = a - PI * (a / PI).round();
    if w <= -PI / 2.0 { w + PI } else { w }
}

/// Signed shortest rotation taking `from` to `to`
pub fn shortest_delta(from: f64, to: f64) -> f64 {
    wrap_angle(to - from)
}

/// Shortest difference between two face angles
pub fn face_delta(from: f64, to: f64) -> f64 {
    wrap_face(to - from)
}

/// Circular interpolation along the shortest arc
pub fn lerp_angle(a: f64, b: f64, t: f64) -> f64 {
    wrap_angle(a + shortest_delta(a, b) * t)
}

fn finite_or(x: f64, fallback: f64) -> f64 {
    if x.is_finite() { x } else { fallback }
}

/// Clamp that tolerates an empty interval by pinning to `lo`.
fn clamp_soft(x: f64, lo: f64, hi: f64) -> f64 {
    if lo > hi { lo } else { x.clamp(lo, hi) }
}

// =============================================================================
// Colors
// =============================================================================

/// RGB, channels in [0, 1]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Color {
    pub r: f64,
    pub g: f64,
    pub b: f64,
}

impl Color {
    pub const STONE: Color = Color { r: 0.55, g: 0.55, b: 0.58 };

    /// Teal for bullish, rust for bearish, brightness from volume.
    pub fn from_features(fv: &FeatureVector) -> Color {
        let f = fv.clamped();
        let d = fv.direction_score();
        let light = 0.55 + 0.35 * f.volume;
        let (r, g, b) = if d >= 0.0 {
            (0.35 - 0.2 * d, 0.55 + 0.3 * d, 0.55 + 0.15 * d)
        } else {
            (0.55 - 0.3 * d, 0.4 + 0.1 * d, 0.35 + 0.1 * d)
        };
        Color { r: (r * light).clamp(0.0, 1.0), g: (g * light).clamp(0.0, 1.0), b: (b * light).clamp(0.0, 1.0) }
    }

    pub fn lerp(a: Color, b: Color, t: f64) -> Color {
        Color { r: a.r + (b.r - a.r) * t, g: a.g + (b.g - a.g) * t, b: a.b + (b.b - a.b) * t }
    }

    pub fn to_hex(&self) -> String {
        let ch = |v: f64| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        format!("#{:02x}{:02x}{:02x}", ch(self.r), ch(self.g), ch(self.b))
    }
}

// =============================================================================
// Parameters
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeometryParams {
    pub base_width: f64,
    pub height: f64,
    /// Fraction by which the top face is narrower than the base
    pub taper: f64,
    /// Side bulge, [0, 1]
    pub roundness: f64,
    pub bottom_angle_offset: f64,
    pub top_angle_offset: f64,
}

impl Default for GeometryParams {
    fn default() -> Self {
        Self {
            base_width: 100.0,
            height: 80.0,
            taper: 0.1,
            roundness: 0.5,
            bottom_angle_offset: 0.0,
            top_angle_offset: 0.0,
        }
    }
}

impl GeometryParams {
    pub fn top_width(&self) -> f64 {
        self.base_width * (1.0 - self.taper)
    }

    /// Clamp into the construction-safe envelope. The flag reports whether
    /// anything had to change.
    pub fn sanitized(&self) -> (GeometryParams, bool) {
        let d = GeometryParams::default();
        let base_width = finite_or(self.base_width, d.base_width).clamp(MIN_WIDTH, MAX_WIDTH);
        let min_height = base_width * MIN_ASPECT;
        let out = GeometryParams {
            base_width,
            height: clamp_soft(finite_or(self.height, d.height), min_height, MAX_HEIGHT.max(min_height)),
            taper: finite_or(self.taper, d.taper).clamp(0.0, MAX_TAPER),
            roundness: finite_or(self.roundness, d.roundness).clamp(0.0, 1.0),
            bottom_angle_offset: finite_or(self.bottom_angle_offset, 0.0).clamp(-MAX_OFFSET, MAX_OFFSET),
            top_angle_offset: finite_or(self.top_angle_offset, 0.0).clamp(-MAX_OFFSET, MAX_OFFSET),
        };
        let changed = out != *self;
        (out, changed)
    }

    pub fn lerp(a: &GeometryParams, b: &GeometryParams, t: f64) -> GeometryParams {
        let l = |x: f64, y: f64| x + (y - x) * t;
        GeometryParams {
            base_width: l(a.base_width, b.base_width),
            height: l(a.height, b.height),
            taper: l(a.taper, b.taper),
            roundness: l(a.roundness, b.roundness),
            bottom_angle_offset: lerp_angle(a.bottom_angle_offset, b.bottom_angle_offset, t),
            top_angle_offset: lerp_angle(a.top_angle_offset, b.top_angle_offset, t),
        }
    }
}

/// Map a feature sample to shape parameters.
pub fn derive_params(fv: &FeatureVector) -> GeometryParams {
    let f = fv.clamped();
    let base_width = 70.0 + 50.0 * f.volume;
    GeometryParams {
        base_width,
        height: base_width * (0.7 + 0.4 * f.breadth),
        taper: 0.35 * f.volatility,
        roundness: 1.0 - f.volatility,
        bottom_angle_offset: MAX_OFFSET * 0.5 * f.order_imbalance,
        top_angle_offset: MAX_OFFSET * f.momentum,
    }
}

// =============================================================================
// Polygon
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalPolygon {
    pub vertices: Vec<DVec2>,
    /// Indices of the bottom face, left then right
    pub bottom: [usize; 2],
    /// Indices of the top face, left then right
    pub top: [usize; 2],
}

/// Build the local polygon, centered near the origin. Params must already be
/// sanitized.
pub fn build_polygon(p: &GeometryParams) -> LocalPolygon {
    let wb = p.base_width * 0.5;
    let wt = p.top_width() * 0.5;
    let h = p.height * 0.5;
    let (tb, tt) = (p.bottom_angle_offset.tan(), p.top_angle_offset.tan());

    let bl = DVec2::new(-wb, h - wb * tb);
    let br = DVec2::new(wb, h + wb * tb);
    let tr = DVec2::new(wt, -h + wt * tt);
    let tl = DVec2::new(-wt, -h - wt * tt);

    let mut vertices = Vec::with_capacity(2 * SIDE_SEGMENTS + 2);
    vertices.push(bl);
    vertices.push(br);
    push_side(&mut vertices, br, tr, p.roundness * BULGE * p.base_width);
    vertices.push(tr);
    vertices.push(tl);
    push_side(&mut vertices, tl, bl, p.roundness * BULGE * p.base_width);

    let tr_idx = SIDE_SEGMENTS + 1;
    LocalPolygon { vertices, bottom: [0, 1], top: [tr_idx + 1, tr_idx] }
}

/// Interior points of a side, bulged outward along a half sine.
fn push_side(out: &mut Vec<DVec2>, from: DVec2, to: DVec2, bulge: f64) {
    let d = to - from;
    let normal = d.perp() / d.length().max(1e-9);
    for k in 1..SIDE_SEGMENTS {
        let s = k as f64 / SIDE_SEGMENTS as f64;
        out.push(from.lerp(to, s) + normal * (bulge * (PI * s).sin()));
    }
}

// =============================================================================
// World frame
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StoneMetrics {
    pub bottom_midpoint: DVec2,
    pub top_midpoint: DVec2,
    pub bottom_angle: f64,
    pub top_angle: f64,
    pub bottom_width: f64,
    pub top_width: f64,
}

/// Metrics for a polygon rendered at `rotation` around `center`.
pub fn world_metrics(
    params: &GeometryParams,
    polygon: &LocalPolygon,
    rotation: f64,
    mirrored: bool,
    center: DVec2,
) -> StoneMetrics {
    let turn = DVec2::from_angle(rotation);
    let place = |i: usize| turn.rotate(polygon.vertices[i]) + center;
    let (low, high) = if mirrored { (polygon.top, polygon.bottom) } else { (polygon.bottom, polygon.top) };
    let (b0, b1) = (place(low[0]), place(low[1]));
    let (t0, t1) = (place(high[0]), place(high[1]));
    let (bottom_off, top_off) = if mirrored {
        (params.top_angle_offset, params.bottom_angle_offset)
    } else {
        (params.bottom_angle_offset, params.top_angle_offset)
    };
    StoneMetrics {
        bottom_midpoint: b0.lerp(b1, 0.5),
        top_midpoint: t0.lerp(t1, 0.5),
        bottom_angle: wrap_face(rotation + bottom_off),
        top_angle: wrap_face(rotation + top_off),
        bottom_width: (b1 - b0).length(),
        top_width: (t1 - t0).length(),
    }
}

/// Center that puts the bottom midpoint at (stack_x, top_y).
pub fn landing_center(
    params: &GeometryParams,
    polygon: &LocalPolygon,
    rotation: f64,
    mirrored: bool,
    stack_x: f64,
    top_y: f64,
) -> DVec2 {
    let m = world_metrics(params, polygon, rotation, mirrored, DVec2::ZERO);
    DVec2::new(stack_x - m.bottom_midpoint.x, top_y - m.bottom_midpoint.y)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoneGeometry {
    pub params: GeometryParams,
    pub polygon: LocalPolygon,
    /// Direction the features implied at build time
    pub implied: Stance,
    pub prev_orientation: f64,
    pub angle_long: f64,
    pub angle_short: f64,
    /// Params had to be clamped into the safe envelope
    pub clamped: bool,
}

impl StoneGeometry {
    /// Pure: the orientation comes in as an argument, the ledger is never read.
    pub fn build(params: &GeometryParams, prev_orientation: f64, implied: Stance) -> StoneGeometry {
        let (mut p, clamped) = params.sanitized();
        let prev = wrap_face(finite_or(prev_orientation, 0.0));
        let b = p.bottom_angle_offset;

        // Keep the fitted top face inside ±MAX_TOP_TILT
        let (lo, hi) = match implied {
            Stance::Short => (prev + b - MAX_TOP_TILT, prev + b + MAX_TOP_TILT),
            Stance::Long | Stance::Flat => (b - prev - MAX_TOP_TILT, b - prev + MAX_TOP_TILT),
        };
        p.top_angle_offset = clamp_soft(p.top_angle_offset, lo.max(-MAX_OFFSET), hi.min(MAX_OFFSET));

        let angle_long = match implied {
            Stance::Short => wrap_angle(prev - p.top_angle_offset),
            Stance::Long | Stance::Flat => wrap_angle(prev - b),
        };
        StoneGeometry {
            polygon: build_polygon(&p),
            params: p,
            implied,
            prev_orientation: prev,
            angle_long,
            angle_short: wrap_angle(angle_long + PI),
            clamped,
        }
    }

    pub fn rotation(&self, stance: Stance) -> f64 {
        if stance.is_mirrored() { self.angle_short } else { self.angle_long }
    }

    pub fn metrics(&self, stance: Stance, center: DVec2) -> StoneMetrics {
        world_metrics(&self.params, &self.polygon, self.rotation(stance), stance.is_mirrored(), center)
    }

    pub fn landing_center(&self, stance: Stance, stack_x: f64, top_y: f64) -> DVec2 {
        landing_center(&self.params, &self.polygon, self.rotation(stance), stance.is_mirrored(), stack_x, top_y)
    }

    pub fn world_vertices(&self, stance: Stance, center: DVec2) -> Vec<DVec2> {
        let turn = DVec2::from_angle(self.rotation(stance));
        self.polygon.vertices.iter().map(|v| turn.rotate(*v) + center).collect()
    }

    /// Whether rendering with `stance` sits flush on the previous top face.
    pub fn fits(&self, stance: Stance, eps: f64) -> bool {
        let m = self.metrics(stance, DVec2::ZERO);
        face_delta(self.prev_orientation, m.bottom_angle).abs() < eps
    }
}
