use futures::channel::oneshot::Sender as OneshotSender;

use crate::error::Result;
use crate::types::{MethodId, Response, SessionId};

/// A command travelling from a facade to the broker, carrying the oneshot
/// sender its response (or failure) is delivered through.
#[derive(Debug)]
pub struct CommandMessage {
    pub method: MethodId,
    /// `None` addresses the implicit browser-level session.
    pub session_id: Option<SessionId>,
    pub params: Option<serde_json::Value>,
    pub sender: OneshotSender<Result<Response>>,
}

impl CommandMessage {
    pub fn with_session(
        method: impl Into<MethodId>,
        params: Option<serde_json::Value>,
        sender: OneshotSender<Result<Response>>,
        session_id: Option<SessionId>,
    ) -> Self {
        Self {
            method: method.into(),
            session_id,
            params,
            sender,
        }
    }
}
