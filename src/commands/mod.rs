//! Command catalog, validation, and per-command lifecycle.

pub mod catalog;
pub mod dispatch;
pub mod instance;
pub mod schema;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a command instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CommandState {
    Queued,
    InProgress,
    Paused,
    Error,
    Done,
    Cancelled,
    Aborted,
    Expired,
}

impl CommandState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandState::Queued => "queued",
            CommandState::InProgress => "inProgress",
            CommandState::Paused => "paused",
            CommandState::Error => "error",
            CommandState::Done => "done",
            CommandState::Cancelled => "cancelled",
            CommandState::Aborted => "aborted",
            CommandState::Expired => "expired",
        }
    }

    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CommandState::Done
                | CommandState::Cancelled
                | CommandState::Aborted
                | CommandState::Expired
        )
    }

    /// The allowed transition graph.
    pub fn can_transition(&self, to: CommandState) -> bool {
        use CommandState::*;
        match self {
            Queued => matches!(to, InProgress | Cancelled | Expired),
            InProgress => matches!(to, Paused | Done | Error | Cancelled | Aborted),
            Paused => matches!(to, InProgress | Cancelled),
            Error => matches!(to, Queued | InProgress | Cancelled),
            Done | Cancelled | Aborted | Expired => false,
        }
    }
}

impl std::fmt::Display for CommandState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a command instance originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CommandOrigin {
    Cloud,
    Local,
}

impl CommandOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandOrigin::Cloud => "cloud",
            CommandOrigin::Local => "local",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_admit_nothing() {
        use CommandState::*;
        for from in [Done, Cancelled, Aborted, Expired] {
            assert!(from.is_terminal());
            for to in [Queued, InProgress, Paused, Error, Done, Cancelled, Aborted, Expired] {
                assert!(!from.can_transition(to));
            }
        }
    }

    #[test]
    fn test_transition_graph() {
        use CommandState::*;
        assert!(Queued.can_transition(InProgress));
        assert!(Queued.can_transition(Expired));
        assert!(!Queued.can_transition(Done));
        assert!(InProgress.can_transition(Paused));
        assert!(InProgress.can_transition(Aborted));
        assert!(!InProgress.can_transition(Expired));
        assert!(Paused.can_transition(InProgress));
        assert!(!Paused.can_transition(Done));
        assert!(Error.can_transition(Queued));
        assert!(Error.can_transition(InProgress));
        assert!(!Error.can_transition(Done));
    }

    #[test]
    fn test_wire_names() {
        assert_eq!(CommandState::InProgress.as_str(), "inProgress");
        assert_eq!(
            serde_json::to_value(CommandState::InProgress).unwrap(),
            serde_json::json!("inProgress")
        );
    }
}
