//! Executor lifecycle state machine.
//!
//! ```text
//! Created ──initialise──► Initialised ──start──► Started ──stop──► Stopped ──dispose──► Disposed
//!                                                   ▲                 │
//!                                                   └──────start──────┘
//! ```
//!
//! Any state may move to `Failed` when a lifecycle phase errors. Execution
//! is only legal in `Started`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of an executor (and of the mediator guarding it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Created,
    Initialised,
    Started,
    Stopped,
    Disposed,
    /// A lifecycle phase failed. Terminal.
    Failed,
}

impl LifecycleState {
    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Created, Initialised)
                | (Initialised, Started)
                | (Started, Stopped)
                | (Stopped, Started)
                | (Created | Initialised | Stopped, Disposed)
                | (Created | Initialised | Started | Stopped, Failed)
        )
    }

    /// Only a started executor may be invoked.
    pub fn accepts_invocations(self) -> bool {
        self == LifecycleState::Started
    }

    /// True for states that can never accept invocations again.
    pub fn is_terminal(self) -> bool {
        matches!(self, LifecycleState::Disposed | LifecycleState::Failed)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Created => "created",
            LifecycleState::Initialised => "initialised",
            LifecycleState::Started => "started",
            LifecycleState::Stopped => "stopped",
            LifecycleState::Disposed => "disposed",
            LifecycleState::Failed => "failed",
        };
        f.write_str(name)
    }
}
