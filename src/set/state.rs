//! Set lifecycle states and legal transitions
//!
//! States carry a fixed ordinal ranking from worst to best. Online and
//! Degraded share the operational tier; which of the two applies to an
//! incomplete set is a level-policy decision, not encoded in the ranking.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a RAID set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SetState {
    /// Terminal until explicit recovery by an administrator
    Failed,
    /// Shutting down; no members left worth serving
    Terminating,
    /// Assembling membership; not yet serving
    Initializing,
    /// Complete membership, serving I/O
    Online,
    /// Partial membership, still serving I/O
    Degraded,
}

/// Externally visible status of a set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SetStatus {
    /// Not serving I/O
    Offline,
    /// Serving with full membership
    Online,
    /// Serving with reduced membership
    Degraded,
}

impl SetState {
    /// Ordinal rank, worst to best; Online and Degraded share a tier
    pub fn rank(self) -> u8 {
        match self {
            SetState::Failed => 0,
            SetState::Terminating => 1,
            SetState::Initializing => 2,
            SetState::Online | SetState::Degraded => 3,
        }
    }

    /// Whether a transition from `self` to `target` is legal
    ///
    /// Legality is asymmetric per target: Failed is always reachable,
    /// everything else requires the current state to sit high enough.
    /// Illegal transitions are no-ops at the call site.
    pub fn can_transition_to(self, target: SetState) -> bool {
        match target {
            SetState::Failed => true,
            SetState::Terminating => self.rank() > SetState::Failed.rank(),
            SetState::Initializing => self.rank() > SetState::Terminating.rank(),
            SetState::Online | SetState::Degraded => {
                self.rank() >= SetState::Initializing.rank()
            }
        }
    }

    /// Whether the set is serving I/O in this state
    pub fn is_operational(self) -> bool {
        matches!(self, SetState::Online | SetState::Degraded)
    }

    /// Externally visible status mapping
    pub fn status(self) -> SetStatus {
        match self {
            SetState::Failed | SetState::Terminating | SetState::Initializing => SetStatus::Offline,
            SetState::Online => SetStatus::Online,
            SetState::Degraded => SetStatus::Degraded,
        }
    }
}

/// Target state for a healthy reconfiguration
///
/// Complete membership goes Online. An empty set with no spares has
/// nothing left to do and terminates. Anything in between initializes;
/// the level policy may later upgrade that to Degraded.
pub fn next_state(active_count: usize, member_count: usize, spares_empty: bool) -> SetState {
    if active_count == member_count {
        SetState::Online
    } else if active_count == 0 && spares_empty {
        SetState::Terminating
    } else {
        SetState::Initializing
    }
}
