use proxy_types::Sats;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Something that moves a node's score.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReputationEvent {
    /// A verifier passed the node's proof on a task with this bid.
    Pass { bid: Sats },
    /// A verifier failed the node's proof.
    Fail,
    /// The node missed the execution deadline.
    Flake,
    /// The node declined, or did not start, after being matched.
    Declined,
    /// One full interval of continuous heartbeat silence.
    MissedInterval,
    /// Operator re-certification: the score is reset, not shifted.
    Recertify,
}

impl ReputationEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass { .. } => "pass",
            Self::Fail => "fail",
            Self::Flake => "flake",
            Self::Declined => "declined",
            Self::MissedInterval => "missed_interval",
            Self::Recertify => "recertify",
        }
    }
}

impl fmt::Display for ReputationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
