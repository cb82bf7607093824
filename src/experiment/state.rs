//! Plan runner lifecycle.

use crate::safety::AbortReason;

/// Runner state.
///
/// # State Machine
///
/// ```text
/// Idle ──> Configuring(n) ──> Sampling(n) ──hold elapsed──> Configuring(n+1) ... ──> Completed
///                │                 │
///                │                 ├──safety / max_hours──> Aborted
///                └─────────────────┴──instrument fault────> Failed
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum RunState {
    /// Not started.
    Idle,
    /// Applying the settings of step `n`.
    Configuring(usize),
    /// Sampling during the hold of step `n`.
    Sampling(usize),
    /// Every step ran to the end of its hold.
    Completed,
    /// A safety condition or the elapsed cap stopped the run.
    Aborted(AbortReason),
    /// An instrument error escaped the runner.
    Failed(String),
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Idle => write!(f, "Idle"),
            RunState::Configuring(step) => write!(f, "Configuring step {}", step),
            RunState::Sampling(step) => write!(f, "Sampling step {}", step),
            RunState::Completed => write!(f, "Completed"),
            RunState::Aborted(reason) => write!(f, "Aborted: {}", reason),
            RunState::Failed(error) => write!(f, "Failed: {}", error),
        }
    }
}

impl RunState {
    /// Terminal states accept no further work.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Aborted(_) | RunState::Failed(_)
        )
    }

    /// Step being executed, if any.
    pub fn step(&self) -> Option<usize> {
        match self {
            RunState::Configuring(step) | RunState::Sampling(step) => Some(*step),
            _ => None,
        }
    }
}

/// How a run ended when no error escaped.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// All steps finished.
    Completed {
        /// Records emitted.
        ticks: usize,
    },
    /// Stopped by a safety condition or the elapsed cap.
    Aborted {
        /// What fired.
        reason: AbortReason,
        /// Step index at the time.
        step: usize,
        /// Records emitted, including the final one.
        ticks: usize,
    },
}

impl RunOutcome {
    /// Records emitted.
    pub fn ticks(&self) -> usize {
        match self {
            RunOutcome::Completed { ticks } | RunOutcome::Aborted { ticks, .. } => *ticks,
        }
    }

    /// The abort reason, if aborted.
    pub fn abort_reason(&self) -> Option<&AbortReason> {
        match self {
            RunOutcome::Aborted { reason, .. } => Some(reason),
            RunOutcome::Completed { .. } => None,
        }
    }
}
