//! Stance-driven stone stacking.
//!
//! Feature samples become procedural stones. Each committed stone sits on the
//! one below; whether it fits shows whether the held stance agrees with the
//! market. Misalignment builds severity, and severity knocks stones off.

pub mod engine;
pub mod features;
pub mod geometry;
pub mod ledger;
pub mod logging;
pub mod loss;
pub mod morph;
pub mod physics;
pub mod scheduler;
pub mod stance;
pub mod state;
