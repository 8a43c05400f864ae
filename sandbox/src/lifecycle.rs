//! Execution lifecycle.
//!
//! ```text
//! Loaded -> Linked -> Running <-> Suspended
//!                        |           |
//!                        v           v
//!                  Settled | Failed (terminal)
//! ```
//!
//! `Linked -> Failed` covers instantiation failures before any guest code
//! runs. Nothing leaves a terminal state.

use std::fmt;

use crate::error::SandboxError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionState {
    Loaded,
    Linked,
    Running,
    Suspended,
    Settled,
    Failed,
}

impl ExecutionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Settled | Self::Failed)
    }

    /// Whether `self -> to` is a legal transition.
    pub fn can_transition(self, to: ExecutionState) -> bool {
        use ExecutionState::*;
        matches!(
            (self, to),
            (Loaded, Linked)
                | (Loaded, Failed)
                | (Linked, Running)
                | (Linked, Failed)
                | (Running, Suspended)
                | (Running, Settled)
                | (Running, Failed)
                | (Suspended, Running)
                | (Suspended, Settled)
                | (Suspended, Failed)
        )
    }

    /// Checked transition.
    pub fn advance(&mut self, to: ExecutionState) -> Result<(), SandboxError> {
        if !self.can_transition(to) {
            return Err(SandboxError::InvalidTransition { from: *self, to });
        }
        *self = to;
        Ok(())
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Loaded => "Loaded",
            Self::Linked => "Linked",
            Self::Running => "Running",
            Self::Suspended => "Suspended",
            Self::Settled => "Settled",
            Self::Failed => "Failed",
        };
        f.write_str(name)
    }
}
