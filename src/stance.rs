//! Operator stance and the commands that change it.

use serde::{Deserialize, Serialize};

use crate::engine::state::Phase;
use crate::logging::log_stance;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stance {
    Long,
    Short,
    /// No position held; suppresses commitment
    Flat,
}

impl Stance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stance::Long => "long",
            Stance::Short => "short",
            Stance::Flat => "flat",
        }
    }

    /// +1 long, -1 short, 0 flat
    pub fn sign(&self) -> f64 {
        match self {
            Stance::Long => 1.0,
            Stance::Short => -1.0,
            Stance::Flat => 0.0,
        }
    }

    /// Short renders the stone upside down
    pub fn is_mirrored(&self) -> bool {
        matches!(self, Stance::Short)
    }

    pub fn flipped(&self) -> Stance {
        match self {
            Stance::Long => Stance::Short,
            Stance::Short | Stance::Flat => Stance::Long,
        }
    }
}

impl std::str::FromStr for Stance {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "long" => Ok(Stance::Long),
            "short" => Ok(Stance::Short),
            "flat" => Ok(Stance::Flat),
            other => anyhow::bail!("unknown stance: {}", other),
        }
    }
}

/// Result of an operator command, so the controller knows what to touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanceChange {
    /// Command arrived outside hovering
    Ignored,
    Flipped { from: Stance, to: Stance },
    MarkedFlat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StanceTracker {
    stance: Stance,
}

impl StanceTracker {
    pub fn new(initial: Stance) -> Self {
        Self { stance: initial }
    }

    pub fn current(&self) -> Stance {
        self.stance
    }

    /// Long <-> short, flat -> long. Orientation locks once a stone leaves
    /// hovering, so this is a no-op in every other phase.
    pub fn flip(&mut self, phase: Phase) -> StanceChange {
        let from = self.stance;
        if phase != Phase::Hovering {
            log_stance("flip", from.as_str(), from.as_str(), false);
            return StanceChange::Ignored;
        }
        self.stance = from.flipped();
        log_stance("flip", from.as_str(), self.stance.as_str(), true);
        StanceChange::Flipped { from, to: self.stance }
    }

    /// Go flat. The caller marks the current hover stone for discard.
    pub fn set_flat(&mut self, phase: Phase) -> StanceChange {
        let from = self.stance;
        if phase != Phase::Hovering {
            log_stance("set_flat", from.as_str(), from.as_str(), false);
            return StanceChange::Ignored;
        }
        self.stance = Stance::Flat;
        log_stance("set_flat", from.as_str(), "flat", true);
        StanceChange::MarkedFlat
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flip_cycles_long_short() {
        let mut t = StanceTracker::new(Stance::Long);
        assert_eq!(t.flip(Phase::Hovering), StanceChange::Flipped { from: Stance::Long, to: Stance::Short });
        t.flip(Phase::Hovering);
        assert_eq!(t.current(), Stance::Long);
    }

    #[test]
    fn test_flip_from_flat_goes_long() {
        let mut t = StanceTracker::new(Stance::Flat);
        t.flip(Phase::Hovering);
        assert_eq!(t.current(), Stance::Long);
    }

    #[test]
    fn test_commands_ignored_outside_hovering() {
        let mut t = StanceTracker::new(Stance::Short);
        for phase in [Phase::Placing, Phase::Stable, Phase::Loss] {
            assert_eq!(t.flip(phase), StanceChange::Ignored);
            assert_eq!(t.set_flat(phase), StanceChange::Ignored);
            assert_eq!(t.current(), Stance::Short);
        }
    }

    #[test]
    fn test_set_flat() {
        let mut t = StanceTracker::new(Stance::Long);
        assert_eq!(t.set_flat(Phase::Hovering), StanceChange::MarkedFlat);
        assert_eq!(t.current(), Stance::Flat);
        assert_eq!(Stance::Flat.sign(), 0.0);
    }

    #[test]
    fn test_parse_stance() {
        assert_eq!(" Short ".parse::<Stance>().unwrap(), Stance::Short);
        assert_eq!("FLAT".parse::<Stance>().unwrap(), Stance::Flat);
        assert!("sideways".parse::<Stance>().is_err());
    }
}
