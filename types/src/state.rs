//! Node status and capability tier.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::params::ProtocolParams;

/// The standing of a node, derived from its reputation (except `Retired`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    /// Reputation at or above the probation threshold.
    Active,
    /// Reputation between the suspension and probation thresholds.
    Probation,
    /// Reputation below the suspension threshold; not matchable.
    Suspended,
    /// Terminal. Set explicitly by an operator or after prolonged inactivity.
    Retired,
}

impl NodeStatus {
    /// The status a non-retired node with this score must have.
    pub fn for_reputation(reputation: u32, params: &ProtocolParams) -> Self {
        if reputation < params.suspend_below {
            Self::Suspended
        } else if reputation < params.probation_below {
            Self::Probation
        } else {
            Self::Active
        }
    }

    /// Whether the matcher may offer tasks to a node in this status.
    pub fn is_matchable(&self) -> bool {
        matches!(self, Self::Active | Self::Probation)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Probation => "PROBATION",
            Self::Suspended => "SUSPENDED",
            Self::Retired => "RETIRED",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capability tier 1–3 (Bronze, Silver, Gold).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Tier(u8);

impl Tier {
    pub const BRONZE: Self = Self(1);
    pub const SILVER: Self = Self(2);
    pub const GOLD: Self = Self(3);

    pub fn new(level: u8) -> Option<Self> {
        (1..=3).contains(&level).then_some(Self(level))
    }

    pub fn level(&self) -> u8 {
        self.0
    }

    /// Largest bid a node of this tier may be assigned, `None` for unlimited.
    pub fn bid_cap_sats(&self, params: &ProtocolParams) -> Option<u64> {
        match self.0 {
            1 => Some(params.bronze_max_bid_sats),
            2 => Some(params.silver_max_bid_sats),
            _ => None,
        }
    }

    /// Whether a node of this tier may carry a bid of `sats`.
    pub fn can_carry_bid(&self, sats: u64, params: &ProtocolParams) -> bool {
        self.bid_cap_sats(params).map_or(true, |cap| sats <= cap)
    }
}

impl TryFrom<u8> for Tier {
    type Error = String;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        Self::new(level).ok_or_else(|| format!("tier must be 1, 2 or 3, got {level}"))
    }
}

impl From<Tier> for u8 {
    fn from(tier: Tier) -> u8 {
        tier.0
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.0 {
            1 => "bronze",
            2 => "silver",
            _ => "gold",
        };
        write!(f, "{} ({})", self.0, name)
    }
}
