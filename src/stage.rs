use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The seven pipeline stages, in promotion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Ideate,
    Sanitize,
    Backtest,
    Score,
    Select,
    Deploy,
    Monitor,
}

impl StageKind {
    pub const ORDER: [StageKind; 7] = [
        StageKind::Ideate,
        StageKind::Sanitize,
        StageKind::Backtest,
        StageKind::Score,
        StageKind::Select,
        StageKind::Deploy,
        StageKind::Monitor,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Ideate => "ideate",
            StageKind::Sanitize => "sanitize",
            StageKind::Backtest => "backtest",
            StageKind::Score => "score",
            StageKind::Select => "select",
            StageKind::Deploy => "deploy",
            StageKind::Monitor => "monitor",
        }
    }

    pub fn index(self) -> usize {
        match self {
            StageKind::Ideate => 0,
            StageKind::Sanitize => 1,
            StageKind::Backtest => 2,
            StageKind::Score => 3,
            StageKind::Select => 4,
            StageKind::Deploy => 5,
            StageKind::Monitor => 6,
        }
    }

    /// Immediate predecessor in the fixed order.
    pub fn predecessor(self) -> Option<StageKind> {
        match self.index() {
            0 => None,
            i => Some(Self::ORDER[i - 1]),
        }
    }

    /// Every stage that must have succeeded before this one may start.
    pub fn predecessors(self) -> &'static [StageKind] {
        &Self::ORDER[..self.index()]
    }

    pub fn next(self) -> Option<StageKind> {
        Self::ORDER.get(self.index() + 1).copied()
    }

    /// Stages the feedback loop is allowed to re-enter.
    pub fn is_reentry_point(self) -> bool {
        matches!(self, StageKind::Ideate | StageKind::Backtest | StageKind::Monitor)
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for StageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ideate" => Ok(StageKind::Ideate),
            "sanitize" => Ok(StageKind::Sanitize),
            "backtest" => Ok(StageKind::Backtest),
            "score" => Ok(StageKind::Score),
            "select" => Ok(StageKind::Select),
            "deploy" => Ok(StageKind::Deploy),
            "monitor" => Ok(StageKind::Monitor),
            other => Err(format!("unknown stage kind: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_is_fixed() {
        for (i, stage) in StageKind::ORDER.iter().enumerate() {
            assert_eq!(stage.index(), i);
        }
        assert_eq!(StageKind::Ideate.predecessor(), None);
        assert_eq!(StageKind::Deploy.predecessor(), Some(StageKind::Select));
        assert_eq!(StageKind::Monitor.next(), None);
    }

    #[test]
    fn test_predecessors_are_prefix() {
        assert!(StageKind::Ideate.predecessors().is_empty());
        assert_eq!(
            StageKind::Score.predecessors(),
            &[StageKind::Ideate, StageKind::Sanitize, StageKind::Backtest]
        );
    }

    #[test]
    fn test_parse_roundtrip_names() {
        for stage in StageKind::ORDER {
            assert_eq!(stage.as_str().parse::<StageKind>().unwrap(), stage);
        }
        assert_eq!(" Deploy ".parse::<StageKind>().unwrap(), StageKind::Deploy);
        assert!("launch".parse::<StageKind>().is_err());
    }
}
