use futures::channel::mpsc::Sender;
use futures::channel::oneshot::channel as oneshot_channel;
use futures::SinkExt;

use crate::error::{CdpError, Result};
use crate::handler::{CommandFuture, HandlerMessage};
use crate::session::Session;
use crate::types::{MethodId, Response, SessionId, TargetId};

/// A page target and the sessions attached to it, in attach order.
///
/// Like [`Session`](crate::session::Session) this is a handle around the
/// broker channel; the broker keeps the authoritative records and tears them
/// down on detach and destroy events regardless of what handles still exist.
#[derive(Debug)]
pub struct Tab {
    id: TargetId,
    sender: Sender<HandlerMessage>,
    sessions: Vec<Session>,
}

impl Tab {
    pub(crate) fn new(id: TargetId, sender: Sender<HandlerMessage>) -> Self {
        Self {
            id,
            sender,
            sessions: Vec::new(),
        }
    }

    pub fn target_id(&self) -> &TargetId {
        &self.id
    }

    /// The primary session: the first one attached.
    pub fn session(&self) -> Option<&Session> {
        self.sessions.first()
    }

    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }

    /// Send a command on the primary session.
    pub fn send_command(
        &self,
        method: impl Into<MethodId>,
        params: Option<serde_json::Value>,
    ) -> Result<CommandFuture> {
        let session = self
            .sessions
            .first()
            .ok_or_else(|| CdpError::msg("cannot send a command without an attached session"))?;
        Ok(session.send_command(method, params))
    }

    /// Attach a new flat session to this target.
    pub async fn create_session(&mut self) -> Result<Session> {
        let (tx, rx) = oneshot_channel();
        self.sender
            .clone()
            .send(HandlerMessage::CreateSession {
                target_id: self.id.clone(),
                tx,
            })
            .await?;
        let session_id = rx.await??;
        let session = Session::new(session_id, self.sender.clone());
        self.sessions.push(session.clone());
        Ok(session)
    }

    /// Detach a session by id. The local handle list shrinks even when the
    /// browser reports an error for the detach itself.
    pub async fn close_session(&mut self, session_id: impl Into<SessionId>) -> Result<Response> {
        let session_id = session_id.into();
        let (tx, rx) = oneshot_channel();
        self.sender
            .clone()
            .send(HandlerMessage::CloseSession {
                session_id: session_id.clone(),
                tx,
            })
            .await?;
        let res = rx.await?;
        self.sessions.retain(|s| s.session_id() != &session_id);
        tracing::debug!(session = %session_id, "session closed");
        res
    }
}
