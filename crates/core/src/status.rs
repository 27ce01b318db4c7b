//! Kernel status state machine.
//!
//! One [`StatusCell`] is shared between the manager, the session registry,
//! and the kernel phase listeners wired into the connection. All of them
//! drive it through [`StatusCell::transition`], which enforces the allowed
//! transition table and makes same-state transitions no-ops, so overlapping
//! signals (engine `idle` event plus the manager's own post-execute
//! convergence) settle without flapping.

use parking_lot::Mutex;

/// Externally observable kernel status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// A kernel is being created (initial load or restart in flight).
    Starting,
    /// A kernel is live and not executing.
    Idle,
    /// A kernel is executing code.
    Busy,
    /// Initialization or restart failed; only a restart leaves this state.
    Error,
}

impl Status {
    fn name(self) -> &'static str {
        match self {
            Status::Starting => "starting",
            Status::Idle => "idle",
            Status::Busy => "busy",
            Status::Error => "error",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Shared status cell enforcing the transition table.
#[derive(Debug)]
pub struct StatusCell {
    current: Mutex<Status>,
}

impl StatusCell {
    /// New cell in [`Status::Starting`].
    pub fn new() -> Self {
        Self {
            current: Mutex::new(Status::Starting),
        }
    }

    /// Current status.
    pub fn get(&self) -> Status {
        *self.current.lock()
    }

    /// Attempts to move to `next`.
    ///
    /// Returns `true` if the transition was applied (or was a same-state
    /// no-op). Invalid transitions leave the cell untouched and log a
    /// warning; in particular `Error` can only be left through `Starting`.
    pub fn transition(&self, next: Status) -> bool {
        let mut current = self.current.lock();
        if *current == next {
            return true;
        }
        if !allowed(*current, next) {
            tracing::warn!(from = %current, to = %next, "rejected status transition");
            return false;
        }
        tracing::debug!(from = %current, to = %next, "status transition");
        *current = next;
        true
    }
}

impl Default for StatusCell {
    fn default() -> Self {
        Self::new()
    }
}

fn allowed(from: Status, to: Status) -> bool {
    matches!(
        (from, to),
        (Status::Starting, Status::Idle)
            | (Status::Starting, Status::Error)
            | (Status::Idle, Status::Busy)
            | (Status::Idle, Status::Starting)
            | (Status::Busy, Status::Idle)
            | (Status::Busy, Status::Starting)
            | (Status::Error, Status::Starting)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_in_starting() {
        assert_eq!(StatusCell::new().get(), Status::Starting);
    }

    #[test]
    fn happy_path_lifecycle() {
        let cell = StatusCell::new();
        assert!(cell.transition(Status::Idle));
        assert!(cell.transition(Status::Busy));
        assert!(cell.transition(Status::Idle));
        assert!(cell.transition(Status::Starting));
        assert!(cell.transition(Status::Error));
        assert_eq!(cell.get(), Status::Error);
    }

    #[test]
    fn error_is_only_left_through_starting() {
        let cell = StatusCell::new();
        cell.transition(Status::Error);
        assert!(!cell.transition(Status::Busy));
        assert!(!cell.transition(Status::Idle));
        assert_eq!(cell.get(), Status::Error);
        assert!(cell.transition(Status::Starting));
        assert!(cell.transition(Status::Idle));
    }

    #[test]
    fn same_state_transition_is_a_noop() {
        let cell = StatusCell::new();
        cell.transition(Status::Idle);
        assert!(cell.transition(Status::Idle));
        assert_eq!(cell.get(), Status::Idle);
    }

    #[test]
    fn starting_cannot_jump_to_busy() {
        let cell = StatusCell::new();
        assert!(!cell.transition(Status::Busy));
        assert_eq!(cell.get(), Status::Starting);
    }

    #[test]
    fn display_names_are_lowercase() {
        assert_eq!(Status::Starting.to_string(), "starting");
        assert_eq!(Status::Idle.to_string(), "idle");
        assert_eq!(Status::Busy.to_string(), "busy");
        assert_eq!(Status::Error.to_string(), "error");
    }
}
