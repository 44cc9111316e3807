use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::channel::mpsc;
use futures::channel::oneshot::{self, channel as oneshot_channel};
use pin_project_lite::pin_project;

use crate::cmd::CommandMessage;
use crate::error::{CdpError, Result};
use crate::handler::HandlerMessage;
use crate::types::{MethodId, Response, SessionId};

pin_project! {
    /// The future returned by `send_command`.
    ///
    /// Hands the command to the broker on first poll, then waits on the
    /// pending slot. Dropping it abandons interest in the result; the
    /// in-flight request is not cancelled and the broker still resolves and
    /// collects the slot when the response arrives.
    pub struct CommandFuture {
        #[pin]
        rx_command: oneshot::Receiver<Result<Response>>,
        #[pin]
        sender: mpsc::Sender<HandlerMessage>,
        message: Option<HandlerMessage>,
    }
}

impl CommandFuture {
    pub(crate) fn new(
        method: impl Into<MethodId>,
        params: Option<serde_json::Value>,
        session_id: Option<SessionId>,
        sender: mpsc::Sender<HandlerMessage>,
    ) -> Self {
        let (tx, rx_command) = oneshot_channel();
        let message = Some(HandlerMessage::Command(CommandMessage::with_session(
            method, params, tx, session_id,
        )));
        Self {
            rx_command,
            sender,
            message,
        }
    }
}

impl Future for CommandFuture {
    type Output = Result<Response>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();

        if this.message.is_some() {
            match this.sender.poll_ready(cx) {
                Poll::Ready(Err(err)) => Poll::Ready(Err(err.into())),
                Poll::Ready(Ok(())) => {
                    let message = this.message.take().expect("existence checked above");
                    if let Err(err) = this.sender.start_send(message) {
                        return Poll::Ready(Err(err.into()));
                    }
                    cx.waker().wake_by_ref();
                    Poll::Pending
                }
                Poll::Pending => Poll::Pending,
            }
        } else {
            match this.rx_command.as_mut().poll(cx) {
                Poll::Ready(Ok(res)) => Poll::Ready(res),
                Poll::Ready(Err(err)) => Poll::Ready(Err(err.into())),
                Poll::Pending => Poll::Pending,
            }
        }
    }
}

impl std::fmt::Debug for CommandFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandFuture").finish()
    }
}
