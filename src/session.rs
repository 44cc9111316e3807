use futures::channel::mpsc::Sender;
use futures::channel::oneshot;

use crate::error::{CdpError, Result};
use crate::handler::{CommandFuture, HandlerMessage};
use crate::listeners::{EventStream, NextEvent, SubscriptionSink};
use crate::types::{MethodId, SessionId};

/// A single conversation with a target.
///
/// This is a lightweight handle: the id plus the channel to the broker,
/// which owns the actual session state. Cloning it does not attach anything
/// and dropping it does not detach anything.
#[derive(Debug, Clone)]
pub struct Session {
    id: SessionId,
    sender: Sender<HandlerMessage>,
}

impl Session {
    pub(crate) fn new(id: SessionId, sender: Sender<HandlerMessage>) -> Self {
        Self { id, sender }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.id
    }

    /// Send a devtools command on this session.
    ///
    /// The future resolves with the raw response: a per-request CDP `error`
    /// is data inside it, not an `Err`. After the session detached or the
    /// browser closed it resolves with [`CdpError::Detached`] or
    /// [`CdpError::BrowserClosed`].
    pub fn send_command(
        &self,
        method: impl Into<MethodId>,
        params: Option<serde_json::Value>,
    ) -> CommandFuture {
        CommandFuture::new(
            method,
            params,
            if self.id.is_browser() {
                None
            } else {
                Some(self.id.clone())
            },
            self.sender.clone(),
        )
    }

    /// Subscribe to every event whose method matches `pattern` (exact, or a
    /// trailing-`*` prefix). Registration does not suspend; delivery runs on
    /// whatever task consumes the stream.
    pub fn subscribe(&self, pattern: impl Into<String>) -> Result<EventStream> {
        let (tx, rx) = futures::channel::mpsc::unbounded();
        self.register(pattern.into(), SubscriptionSink::Stream(tx))?;
        Ok(EventStream::new(rx))
    }

    /// Subscribe to the first event matching `pattern`; the subscription is
    /// consumed when it fires.
    pub fn subscribe_once(&self, pattern: impl Into<String>) -> Result<NextEvent> {
        let (tx, rx) = oneshot::channel();
        self.register(pattern.into(), SubscriptionSink::Once(tx))?;
        Ok(NextEvent::new(rx))
    }

    /// Remove a subscription by its exact pattern string.
    pub fn unsubscribe(&self, pattern: impl Into<String>) -> Result<()> {
        let msg = HandlerMessage::Unsubscribe {
            session_id: self.id.clone(),
            pattern: pattern.into(),
        };
        self.sender
            .clone()
            .try_send(msg)
            .map_err(|err| CdpError::from(err.into_send_error()))
    }

    fn register(&self, pattern: String, sink: SubscriptionSink) -> Result<()> {
        if pattern.is_empty() {
            return Err(CdpError::MessageType("pattern must be a non-empty string"));
        }
        let msg = HandlerMessage::Subscribe {
            session_id: self.id.clone(),
            pattern,
            sink,
        };
        self.sender
            .clone()
            .try_send(msg)
            .map_err(|err| CdpError::from(err.into_send_error()))
    }
}
