use iflytek_tts::SessionDescriptor;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Pending,
    Active,
    Confirmed,
    Cancelled,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Confirmed | SessionState::Cancelled | SessionState::Failed
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Pending => "pending",
            SessionState::Active => "active",
            SessionState::Confirmed => "confirmed",
            SessionState::Cancelled => "cancelled",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Session cannot move from {from} to {to}")]
pub struct InvalidTransition {
    pub from: SessionState,
    pub to: SessionState,
}

/// A billable turn and where it is in its lifecycle.
///
/// Starts `Pending`, becomes `Active` once connected and ends in exactly one
/// terminal state, after which it no longer changes.
#[derive(Debug, Clone)]
pub struct Session {
    descriptor: SessionDescriptor,
    state: SessionState,
}

impl Session {
    pub fn new(descriptor: SessionDescriptor) -> Self {
        Self {
            descriptor,
            state: SessionState::Pending,
        }
    }

    pub fn id(&self) -> &str {
        &self.descriptor.session_id
    }

    pub fn descriptor(&self) -> &SessionDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn activate(&mut self) -> Result<(), InvalidTransition> {
        self.transition(SessionState::Active, &[SessionState::Pending])
    }

    pub fn confirm(&mut self) -> Result<(), InvalidTransition> {
        self.transition(
            SessionState::Confirmed,
            &[SessionState::Pending, SessionState::Active],
        )
    }

    pub fn fail(&mut self) -> Result<(), InvalidTransition> {
        self.transition(
            SessionState::Failed,
            &[SessionState::Pending, SessionState::Active],
        )
    }

    /// Only a session that never became active can be cancelled.
    pub fn cancel(&mut self) -> Result<(), InvalidTransition> {
        self.transition(SessionState::Cancelled, &[SessionState::Pending])
    }

    fn transition(
        &mut self,
        to: SessionState,
        allowed_from: &[SessionState],
    ) -> Result<(), InvalidTransition> {
        if !allowed_from.contains(&self.state) {
            return Err(InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }
}
