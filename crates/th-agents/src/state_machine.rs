use serde::{Deserialize, Serialize};
use std::fmt;
use th_core::types::InstanceStatus;

// ---------------------------------------------------------------------------
// LoopState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Idle,
    Working,
    Error,
    Stopped,
}

impl LoopState {
    /// The instance status published for this state.
    pub fn instance_status(&self) -> InstanceStatus {
        match self {
            LoopState::Idle => InstanceStatus::Idle,
            LoopState::Working => InstanceStatus::Working,
            LoopState::Error => InstanceStatus::Error,
            LoopState::Stopped => InstanceStatus::Stopped,
        }
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.instance_status().as_str())
    }
}

// ---------------------------------------------------------------------------
// LoopEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopEvent {
    Claim,
    Finish,
    Fault,
    Recover,
    Stop,
}

impl fmt::Display for LoopEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LoopEvent::Claim => "claim",
            LoopEvent::Finish => "finish",
            LoopEvent::Fault => "fault",
            LoopEvent::Recover => "recover",
            LoopEvent::Stop => "stop",
        };
        f.write_str(label)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StateMachineError {
    #[error("invalid transition: cannot apply {event} in state {state}")]
    InvalidTransition { state: LoopState, event: LoopEvent },
}

// ---------------------------------------------------------------------------
// LoopStateMachine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LoopStateMachine {
    current: LoopState,
    history: Vec<(LoopState, LoopEvent, LoopState)>,
}

impl LoopStateMachine {
    pub fn new() -> Self {
        Self {
            current: LoopState::Idle,
            history: Vec::new(),
        }
    }

    pub fn state(&self) -> LoopState {
        self.current
    }

    pub fn history(&self) -> &[(LoopState, LoopEvent, LoopState)] {
        &self.history
    }

    /// Valid transitions:
    /// - Idle    + Claim   -> Working
    /// - Working + Finish  -> Idle
    /// - Working + Fault   -> Error
    /// - Idle    + Fault   -> Error
    /// - Error   + Recover -> Idle
    /// - any but Stopped + Stop -> Stopped
    pub fn transition(&mut self, event: LoopEvent) -> Result<LoopState, StateMachineError> {
        let next = match (self.current, event) {
            (LoopState::Idle, LoopEvent::Claim) => LoopState::Working,
            (LoopState::Working, LoopEvent::Finish) => LoopState::Idle,
            (LoopState::Working | LoopState::Idle, LoopEvent::Fault) => LoopState::Error,
            (LoopState::Error, LoopEvent::Recover) => LoopState::Idle,
            (state, LoopEvent::Stop) if state != LoopState::Stopped => LoopState::Stopped,
            (state, event) => return Err(StateMachineError::InvalidTransition { state, event }),
        };
        self.history.push((self.current, event, next));
        self.current = next;
        Ok(next)
    }

    pub fn can_transition(&self, event: LoopEvent) -> bool {
        self.clone().transition(event).is_ok()
    }
}

impl Default for LoopStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
