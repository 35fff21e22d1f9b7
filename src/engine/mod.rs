//! Stance-driven stacking engine with a single owned state object.
//!
//! Architecture:
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │Feature Source│────►│  Hover Stone │────►│Placing Stone │
//! │  (pull)      │     │  (morphing)  │     │ (animating)  │
//! └──────────────┘     └──────────────┘     └──────────────┘
//!        │                    ▲  cadence           │ land
//!        ▼                    │                    ▼
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │  Severity    │────►│  Loss Event  │────►│ Stack Ledger │
//! │ (integrated) │     │  (physics)   │     │  (top frame) │
//! └──────────────┘     └──────────────┘     └──────────────┘
//! ```
//!
//! ## Tick order
//!
//! Alignment is evaluated before any hover or placement update, so a loss
//! event preempts a placement that would otherwise land in the same tick.
//! The remaining steps run in sequence on the phase each one leaves behind:
//! during a loss, physics steps and the settle timer may resync the ledger;
//! a `Stable` phase then prepares a hover stone; finally the hover morph or
//! the placement advances. One tick can settle, prepare and advance a hover.

pub mod controller;
pub mod state;

pub use controller::{CommitOutcome, Engine};
pub use state::{Anomaly, EngineSnapshot, EngineState, HoverStone, Phase, PlacingStone};
