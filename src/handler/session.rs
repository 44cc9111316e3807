use crate::listeners::Subscriptions;
use crate::types::{CallId, SessionId, TargetId};

/// An attached conversation with a target.
///
/// Owns the session's monotonic message-id counter and its subscription
/// table; both live with the broker, never with the user-facing handle.
#[derive(Debug)]
pub(crate) struct Session {
    id: SessionId,
    /// The identifier of the target this session is attached to.
    target_id: TargetId,
    next_message_id: u64,
    pub subscriptions: Subscriptions,
}

impl Session {
    pub fn new(id: SessionId, target_id: TargetId) -> Self {
        Self {
            id,
            target_id,
            next_message_id: 0,
            subscriptions: Subscriptions::default(),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.id
    }

    pub fn target_id(&self) -> &TargetId {
        &self.target_id
    }

    /// Allocate the next request id for this session.
    pub fn next_call_id(&mut self) -> CallId {
        let id = CallId::new(self.next_message_id);
        self.next_message_id = self.next_message_id.wrapping_add(1);
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_ids_increase_monotonically() {
        let mut session = Session::new(SessionId::browser(), TargetId::browser());
        assert_eq!(session.next_call_id(), CallId::new(0));
        assert_eq!(session.next_call_id(), CallId::new(1));
        assert_eq!(session.next_call_id(), CallId::new(2));
    }
}
