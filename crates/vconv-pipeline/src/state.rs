//! Pipeline lifecycle state machine.

use std::fmt;
use tracing::debug;
use vconv_core::{ConvertError, Result};

/// Lifecycle of one conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Configuring,
    Running,
    Draining,
    Completed,
    Failed,
}

impl PipelineState {
    /// Completed and Failed are absorbing.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    fn can_transition_to(self, next: Self) -> bool {
        use PipelineState::*;
        match (self, next) {
            (Idle, Configuring) | (Configuring, Running) | (Running, Draining) => true,
            // An encoder may signal end of stream before every input was fed
            (Running | Draining, Completed) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Tracks the current [`PipelineState`] and rejects illegal transitions.
#[derive(Debug)]
pub struct StateMachine {
    state: PipelineState,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self {
            state: PipelineState::Idle,
        }
    }
}

impl StateMachine {
    /// Machine in the `Idle` state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Move to `next`, rejecting transitions the pipeline does not allow.
    pub fn transition(&mut self, next: PipelineState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(ConvertError::invalid_state(
                "pipeline",
                "transition",
                format_args!("{} -> {}", self.state, next),
            ));
        }
        debug!(from = %self.state, to = %next, "pipeline state");
        self.state = next;
        Ok(())
    }

    /// Move to `Failed` unless already terminal.
    pub fn fail(&mut self) {
        if !self.state.is_terminal() {
            debug!(from = %self.state, "pipeline failed");
            self.state = PipelineState::Failed;
        }
    }
}
