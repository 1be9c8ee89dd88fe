//! Task state machine.

use serde::{Deserialize, Serialize};

/// Lifecycle of a task, persisted in the `status` key of its state file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// State file written, not yet handed to the execute queue.
    Created,
    /// Waiting on the execute queue.
    Queued,
    /// A tool is working on it.
    Running,
    /// Outputs registered as resources.
    Success,
    /// Terminal failure; the reason is in `error`.
    Error,
}

impl TaskStatus {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            (Created, Queued) | (Created, Error) |
            (Queued, Running) | (Queued, Error) |
            (Running, Success) | (Running, Error)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Success => "success",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "created" => Self::Created,
            "queued" => Self::Queued,
            "running" => Self::Running,
            "success" => Self::Success,
            "error" => Self::Error,
            _ => return None,
        })
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions() {
        assert!(TaskStatus::Created.can_transition_to(TaskStatus::Queued));
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Success));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Error));
    }

    #[test]
    fn terminal_states_are_final() {
        for terminal in [TaskStatus::Success, TaskStatus::Error] {
            assert!(terminal.is_terminal());
            for target in [
                TaskStatus::Created,
                TaskStatus::Queued,
                TaskStatus::Running,
                TaskStatus::Success,
                TaskStatus::Error,
            ] {
                assert!(!terminal.can_transition_to(target));
            }
        }
    }

    #[test]
    fn cannot_skip_running() {
        assert!(!TaskStatus::Queued.can_transition_to(TaskStatus::Success));
        assert!(!TaskStatus::Created.can_transition_to(TaskStatus::Running));
    }

    #[test]
    fn string_round_trip_matches_serde() {
        let json = serde_json::to_string(&TaskStatus::Running).unwrap();
        assert_eq!(json, "\"running\"");
        assert_eq!(TaskStatus::parse("success"), Some(TaskStatus::Success));
        assert_eq!(TaskStatus::parse("txt2img"), None);
    }
}
