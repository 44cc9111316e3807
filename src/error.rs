use std::io;

use futures::channel::mpsc::SendError;
use futures::channel::oneshot::Canceled;
use thiserror::Error;

use crate::types::MessageKey;

pub type Result<T, E = CdpError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum CdpError {
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("{0}")]
    Serde(#[from] serde_json::Error),
    /// A fatal protocol-level error: the instance reported an `error`
    /// without an `id`. Per-request CDP errors never surface here; they stay
    /// inside the resolved [`Response`](crate::types::Response).
    #[error("{0}")]
    Protocol(#[from] crate::types::Error),
    #[error("The browser pipe was closed.")]
    PipeClosed,
    /// A frame that could not be decoded. The broker logs these and keeps
    /// going; only the codec and its callers see this variant directly.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),
    #[error("Invalid command: {0}")]
    MessageType(&'static str),
    #[error("Command is missing the required key `{0}`")]
    MissingKey(&'static str),
    /// Two in-flight commands were assigned the same `(session, id)` pair.
    /// This is a caller bug, not a browser condition.
    #[error("Duplicate message key {0}")]
    DuplicateKey(MessageKey),
    #[error("The browser is closed.")]
    BrowserClosed,
    #[error("The session was detached from its target.")]
    Detached,
    #[error("Received no response from the chromium instance.")]
    NoResponse,
    #[error("Requested value not found.")]
    NotFound,
    /// Error message related to a response that is not a CDP `error` payload.
    #[error("{0}")]
    ChromeMessage(String),
    #[error("{0}")]
    ChannelSendError(SendError),
}

impl CdpError {
    pub fn msg(msg: impl Into<String>) -> Self {
        CdpError::ChromeMessage(msg.into())
    }
}

impl From<Canceled> for CdpError {
    fn from(_: Canceled) -> Self {
        // The only way a pending slot's sender disappears without a value is
        // the broker going away underneath it.
        CdpError::BrowserClosed
    }
}

impl From<SendError> for CdpError {
    fn from(err: SendError) -> Self {
        if err.is_disconnected() {
            CdpError::BrowserClosed
        } else {
            CdpError::ChannelSendError(err)
        }
    }
}
