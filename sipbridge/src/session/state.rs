use std::fmt;

/// Dialog lifecycle states.
///
/// `Being*` states are pending and expected to time out if nothing
/// moves them along; the rest are terminal. `Registered` and
/// `Unregistered` are the terminal states of a REGISTER session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    BeingEstablished,
    Established,
    BeingCleared,
    BeingCancelled,
    BeingDropped,
    BeingFailed,
    BeingProbed,
    Cleared,
    Cancelled,
    Dropped,
    Failed,
    Rejected,
    Redirected,
    TimedOut,
    Probed,
    Registered,
    Unregistered,
}

impl SessionState {
    /// Terminal states.
    pub const fn is_finalized(&self) -> bool {
        matches!(
            self,
            SessionState::Cleared
                | SessionState::Cancelled
                | SessionState::Dropped
                | SessionState::Failed
                | SessionState::Rejected
                | SessionState::Redirected
                | SessionState::TimedOut
                | SessionState::Probed
                | SessionState::Registered
                | SessionState::Unregistered
        )
    }

    /// Pre-terminal states that should eventually time out.
    pub const fn is_pending(&self) -> bool {
        matches!(
            self,
            SessionState::BeingEstablished
                | SessionState::BeingCleared
                | SessionState::BeingCancelled
                | SessionState::BeingDropped
                | SessionState::BeingFailed
                | SessionState::BeingProbed
        )
    }

    /// The state a pending state settles into. Terminal states map to
    /// themselves; `BeingEstablished` settles into the live call.
    pub const fn finalized(&self) -> SessionState {
        match self {
            SessionState::BeingEstablished => SessionState::Established,
            SessionState::BeingCleared => SessionState::Cleared,
            SessionState::BeingCancelled => SessionState::Cancelled,
            SessionState::BeingDropped => SessionState::Dropped,
            SessionState::BeingFailed => SessionState::Failed,
            SessionState::BeingProbed => SessionState::Probed,
            other => *other,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// What a session is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionMode {
    #[default]
    None,
    Multimedia,
    Registration,
    Subscription,
    KeepAlive,
    Messaging,
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finalize_is_identity_on_terminal_states() {
        assert_eq!(SessionState::Cleared.finalized(), SessionState::Cleared);
        assert_eq!(SessionState::Rejected.finalized(), SessionState::Rejected);
    }

    #[test]
    fn pending_states_settle() {
        assert_eq!(SessionState::BeingEstablished.finalized(), SessionState::Established);
        assert_eq!(SessionState::BeingCancelled.finalized(), SessionState::Cancelled);
        assert_eq!(SessionState::BeingFailed.finalized(), SessionState::Failed);
    }

    #[test]
    fn classification() {
        assert!(SessionState::BeingProbed.is_pending());
        assert!(!SessionState::Established.is_pending());
        assert!(SessionState::Probed.is_finalized());
        assert!(!SessionState::Established.is_finalized());
    }
}
