//! The single logical session's state machine.

use tracing::{error, trace};

use crate::engine::SessionId;

/// `Uninitialized → Active → Closed`, no way back
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum SessionState {
    Uninitialized,
    Active(SessionId),
    Closed,
}

impl SessionState {
    pub(crate) fn init(&mut self, session: SessionId) {
        match *self {
            SessionState::Uninitialized => {
                trace!(session = ?session, "session active");
                *self = SessionState::Active(session);
            }
            // no transition back from Closed, and Active never re-inits
            ref state => error!(?state, "session init out of order"),
        }
    }

    /// Idempotent from `Closed`; forced cleanup may close an uninitialized
    /// session directly
    pub(crate) fn close(&mut self) {
        if *self != SessionState::Closed {
            trace!("session closed");
            *self = SessionState::Closed;
        }
    }

    pub(crate) fn id(&self) -> Option<SessionId> {
        match *self {
            SessionState::Active(id) => Some(id),
            _ => None,
        }
    }

    pub(crate) fn is_uninitialized(&self) -> bool {
        *self == SessionState::Uninitialized
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self == SessionState::Closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_id() -> SessionId {
        // engine hands these out; tests only need a distinct value
        let mut engine = crate::engine::Engine::new(
            crate::Side::Client,
            crate::engine::SaslConfig::Anonymous,
            4096,
            std::time::Duration::from_secs(10),
            1,
        );
        engine.session_open()
    }

    #[test]
    fn transitions_are_monotone() {
        let id = session_id();
        let mut state = SessionState::Uninitialized;
        assert!(state.is_uninitialized());
        state.init(id);
        assert_eq!(state.id(), Some(id));
        state.close();
        assert!(state.is_closed());
        // no regression from Closed
        state.init(id);
        assert!(state.is_closed());
        state.close();
        assert!(state.is_closed());
    }

    #[test]
    fn forced_close_from_uninitialized() {
        let mut state = SessionState::Uninitialized;
        state.close();
        assert!(state.is_closed());
        assert_eq!(state.id(), None);
    }
}
