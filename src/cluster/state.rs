use crate::errdata;
use crate::error::Result;

use std::fmt::Display;

/// A cluster node state. At most one peer is LEADING at any time; the rest
/// are FOLLOWING or in one of the transient states. The declaration order
/// matters: several predicates compare states with `<=` (e.g. shutdown is
/// only complete at or below WAITING, and the lead peer pointer is cleared
/// whenever the new state sorts below SUBSCRIBING).
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum State {
    /// Sentinel for a peer whose state we haven't learned yet.
    Unknown,
    /// Establishing peer connections and looking for fresher history.
    Searching,
    /// Downloading missing commits from the sync peer.
    Synchronizing,
    /// Caught up, waiting for a leader to appear or for our turn to stand up.
    Waiting,
    /// Asked all peers for permission to lead, awaiting their responses.
    StandingUp,
    /// Serializing all writes for the cluster.
    Leading,
    /// Finishing in-flight transactions before giving up leadership.
    StandingDown,
    /// Asked the leader for a subscription, awaiting approval.
    Subscribing,
    /// Applying the leader's transactions.
    Following,
}

impl State {
    /// Returns true if a transition from self to the given state is allowed.
    /// Anything can be observed out of Unknown, since we may first hear from
    /// a peer mid-life.
    pub fn allows(self, to: State) -> bool {
        use State::*;
        match self {
            Unknown => true,
            Searching => matches!(to, Synchronizing | Waiting | Leading),
            Synchronizing => matches!(to, Searching | Waiting),
            Waiting => matches!(to, Searching | StandingUp | Subscribing),
            StandingUp => matches!(to, Searching | Leading),
            Leading => matches!(to, Searching | StandingDown),
            StandingDown => matches!(to, Searching),
            Subscribing => matches!(to, Searching | Following),
            Following => matches!(to, Searching),
        }
    }

    /// Returns the wire name of the state.
    pub fn name(self) -> &'static str {
        match self {
            State::Unknown => "UNKNOWN",
            State::Searching => "SEARCHING",
            State::Synchronizing => "SYNCHRONIZING",
            State::Waiting => "WAITING",
            State::StandingUp => "STANDINGUP",
            State::Leading => "LEADING",
            State::StandingDown => "STANDINGDOWN",
            State::Subscribing => "SUBSCRIBING",
            State::Following => "FOLLOWING",
        }
    }

    /// Parses a wire state name. Unrecognized names map to Unknown, since
    /// peers may run newer versions with states we don't know about.
    pub fn parse(name: &str) -> State {
        match name {
            "SEARCHING" => State::Searching,
            "SYNCHRONIZING" => State::Synchronizing,
            "WAITING" => State::Waiting,
            "STANDINGUP" => State::StandingUp,
            "LEADING" => State::Leading,
            "STANDINGDOWN" => State::StandingDown,
            "SUBSCRIBING" => State::Subscribing,
            "FOLLOWING" => State::Following,
            _ => State::Unknown,
        }
    }

    /// Returns true if the state is one a cluster leader passes through:
    /// STANDINGUP, LEADING, or STANDINGDOWN.
    pub fn is_leaderish(self) -> bool {
        matches!(self, State::StandingUp | State::Leading | State::StandingDown)
    }

    /// Recovers a state from its discriminant, for atomic snapshots shared
    /// with worker threads.
    pub fn from_u8(value: u8) -> State {
        match value {
            1 => State::Searching,
            2 => State::Synchronizing,
            3 => State::Waiting,
            4 => State::StandingUp,
            5 => State::Leading,
            6 => State::StandingDown,
            7 => State::Subscribing,
            8 => State::Following,
            _ => State::Unknown,
        }
    }
}

impl Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// The consistency level required before the leader commits a transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Consistency {
    /// Commit immediately without waiting for any follower approvals.
    Async,
    /// Wait for at least one full peer to approve (if any are configured).
    One,
    /// Wait for a majority of full peers to approve.
    Quorum,
}

impl Consistency {
    pub fn name(self) -> &'static str {
        match self {
            Consistency::Async => "ASYNC",
            Consistency::One => "ONE",
            Consistency::Quorum => "QUORUM",
        }
    }

    pub fn parse(name: &str) -> Result<Consistency> {
        match name {
            "ASYNC" => Ok(Consistency::Async),
            "ONE" => Ok(Consistency::One),
            "QUORUM" => Ok(Consistency::Quorum),
            name => errdata!("unknown consistency level {name}"),
        }
    }
}

impl Display for Consistency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// The lifecycle of the leader's current distributed transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitState {
    /// No transaction has been started yet.
    Uninitialized,
    /// A commit has been requested but not yet begun.
    Waiting,
    /// The transaction is prepared and awaiting follower votes.
    Committing,
    /// The transaction committed.
    Success,
    /// The transaction rolled back or conflicted.
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_table() {
        use State::*;
        let all =
            [Searching, Synchronizing, Waiting, StandingUp, Leading, StandingDown, Subscribing, Following];

        // The allowed transitions, exactly.
        let allowed = [
            (Searching, Synchronizing),
            (Searching, Waiting),
            (Searching, Leading),
            (Synchronizing, Searching),
            (Synchronizing, Waiting),
            (Waiting, Searching),
            (Waiting, StandingUp),
            (Waiting, Subscribing),
            (StandingUp, Searching),
            (StandingUp, Leading),
            (Leading, Searching),
            (Leading, StandingDown),
            (StandingDown, Searching),
            (Subscribing, Searching),
            (Subscribing, Following),
            (Following, Searching),
        ];
        for from in all {
            for to in all {
                assert_eq!(
                    from.allows(to),
                    allowed.contains(&(from, to)),
                    "transition {from} → {to}"
                );
            }
        }
        // Unknown allows everything.
        for to in all {
            assert!(Unknown.allows(to));
        }
    }

    #[test]
    fn ordering() {
        assert!(State::Searching <= State::Waiting);
        assert!(State::Synchronizing <= State::Waiting);
        assert!(State::Waiting <= State::Waiting);
        assert!(State::StandingUp > State::Waiting);
        assert!(State::Following > State::Subscribing);
    }

    #[test]
    fn names_roundtrip() {
        for state in [
            State::Searching,
            State::Synchronizing,
            State::Waiting,
            State::StandingUp,
            State::Leading,
            State::StandingDown,
            State::Subscribing,
            State::Following,
        ] {
            assert_eq!(State::parse(state.name()), state);
        }
        assert_eq!(State::parse("BOGUS"), State::Unknown);
    }
}
