use std::pin::Pin;

use futures::channel::mpsc::Receiver;
use futures::channel::oneshot::Sender as OneshotSender;
use futures::stream::{Fuse, Stream, StreamExt};
use futures::task::{Context, Poll};
use hashbrown::HashMap;
use serde_json::json;

use crate::cmd::CommandMessage;
use crate::conn::Connection;
use crate::error::{CdpError, Result};
use crate::handler::registry::PendingRequests;
use crate::handler::session::Session;
use crate::handler::target::Target;
use crate::listeners::SubscriptionSink;
use crate::types::{self, CdpMessage, Event, MethodCall, MethodId, Response, SessionId, TargetId};

mod commandfuture;
pub(crate) mod registry;
mod session;
mod target;

pub use commandfuture::CommandFuture;

/// The broker that drives the pipe connection: it owns every in-flight
/// request slot, the session and target records, and the subscription
/// tables, and it classifies everything the browser sends back.
///
/// The caller spawns it and polls it to completion; the stream yields an
/// item only for a fatal error and ends when the browser goes away.
#[must_use = "streams do nothing unless polled"]
#[derive(Debug)]
pub struct Handler {
    /// Messages arriving from the user-facing handles.
    from_browser: Fuse<Receiver<HandlerMessage>>,
    /// Connection to the browser instance.
    conn: Connection,
    /// Commands awaiting a response, keyed by `(sessionId, id)`.
    pending: PendingRequests<(PendingRequest, MethodId)>,
    /// Every currently attached session. The browser-level session `""` is
    /// present from the start.
    sessions: HashMap<SessionId, Session>,
    targets: HashMap<TargetId, Target>,
    /// Latched once `Browser.close` was acknowledged or the pipe failed; no
    /// new messages are accepted afterwards.
    closing: bool,
    /// Whether the shim's `{bye}` sentinel arrived, marking the following
    /// EOF as a clean close.
    goodbye: bool,
}

impl Handler {
    /// Create a new `Handler` that drives the connection and listens for
    /// facade messages on the receiver `rx`.
    pub fn new(conn: Connection, rx: Receiver<HandlerMessage>) -> Self {
        let mut sessions = HashMap::new();
        let mut targets = HashMap::new();

        // the browser itself: pseudo-target "0" with the implicit session ""
        let browser_target = TargetId::browser();
        let browser_session = SessionId::browser();
        let mut target = Target::new(browser_target.clone());
        target.push_session(browser_session.clone());
        targets.insert(browser_target.clone(), target);
        sessions.insert(
            browser_session.clone(),
            Session::new(browser_session, browser_target),
        );

        Self {
            from_browser: rx.fuse(),
            conn,
            pending: PendingRequests::default(),
            sessions,
            targets,
            closing: false,
            goodbye: false,
        }
    }

    fn on_handler_message(&mut self, msg: HandlerMessage) {
        match msg {
            HandlerMessage::Command(cmd) => self.on_command(cmd),
            HandlerMessage::Subscribe {
                session_id,
                pattern,
                sink,
            } => match self.sessions.get_mut(&session_id) {
                Some(session) => session.subscriptions.add(pattern, sink),
                None => {
                    tracing::warn!(session = %session_id, %pattern, "subscribe on unknown session");
                }
            },
            HandlerMessage::Unsubscribe {
                session_id,
                pattern,
            } => {
                if let Some(session) = self.sessions.get_mut(&session_id) {
                    session.subscriptions.unsubscribe(&pattern);
                }
            }
            HandlerMessage::CreateSession { target_id, tx } => self.submit_attach(target_id, tx),
            HandlerMessage::CloseSession { session_id, tx } => {
                let params = json!({ "sessionId": session_id.as_str() });
                self.submit_internal(
                    "Target.detachFromTarget",
                    Some(params),
                    PendingRequest::CloseSession { session_id, tx },
                );
            }
            HandlerMessage::CreateTarget { params, tx } => {
                self.submit_internal(
                    "Target.createTarget",
                    Some(params),
                    PendingRequest::CreateTarget(tx),
                );
            }
            HandlerMessage::CloseTarget { target_id, tx } => {
                let params = json!({ "targetId": target_id.as_str() });
                self.submit_internal(
                    "Target.closeTarget",
                    Some(params),
                    PendingRequest::CloseTarget { target_id, tx },
                );
            }
            HandlerMessage::FetchTargets(tx) => {
                self.submit_internal("Target.getTargets", None, PendingRequest::FetchTargets(tx));
            }
            HandlerMessage::CloseBrowser(tx) => {
                self.submit_internal("Browser.close", None, PendingRequest::CloseBrowser(tx));
            }
        }
    }

    /// Submit a command initiated by a user-facing handle.
    fn on_command(&mut self, msg: CommandMessage) {
        if let Err(err) = types::validate_method(&msg.method) {
            let _ = msg.sender.send(Err(err));
            return;
        }
        if let Some(params) = msg.params.as_ref() {
            if !params.is_object() {
                let _ = msg
                    .sender
                    .send(Err(CdpError::MessageType("params must be an object")));
                return;
            }
        }
        let CommandMessage {
            method,
            session_id,
            params,
            sender,
        } = msg;
        let session_id = session_id.unwrap_or_default();
        self.submit(
            &session_id,
            method.clone(),
            params,
            PendingRequest::External(sender),
            method,
        );
    }

    fn submit_attach(&mut self, target_id: TargetId, tx: OneshotSender<Result<SessionId>>) {
        // attaching to a target found via Target.getTargets adopts it
        self.targets
            .entry(target_id.clone())
            .or_insert_with(|| Target::new(target_id.clone()));

        let (method, params) = if target_id.is_browser() {
            ("Target.attachToBrowserTarget", None)
        } else {
            (
                "Target.attachToTarget",
                Some(json!({ "targetId": target_id.as_str(), "flatten": true })),
            )
        };
        self.submit_internal(method, params, PendingRequest::CreateSession { target_id, tx });
    }

    /// Submit one of the broker's own target/session bookkeeping commands.
    /// These always travel on the browser-level session.
    fn submit_internal(
        &mut self,
        method: &'static str,
        params: Option<serde_json::Value>,
        slot: PendingRequest,
    ) {
        self.submit(
            &SessionId::browser(),
            MethodId::from(method),
            params,
            slot,
            MethodId::from(method),
        );
    }

    /// Allocate the session's next id, reserve the slot and write the frame.
    /// Any failure along the way resolves the slot without touching the pipe
    /// beyond what already happened.
    fn submit(
        &mut self,
        session_id: &SessionId,
        method: MethodId,
        params: Option<serde_json::Value>,
        slot: PendingRequest,
        slot_method: MethodId,
    ) {
        if self.closing {
            fail(slot, CdpError::BrowserClosed);
            return;
        }
        let Some(session) = self.sessions.get_mut(session_id) else {
            fail(slot, CdpError::BrowserClosed);
            return;
        };
        let id = session.next_call_id();
        let key = types::MessageKey::new(session_id.clone(), id);

        let call = MethodCall {
            id,
            method,
            session_id: if session_id.is_browser() {
                None
            } else {
                Some(session_id.clone())
            },
            params,
        };

        if let Err(slot) = self.pending.reserve(key.clone(), (slot, slot_method)) {
            fail(slot.0, CdpError::DuplicateKey(key));
            return;
        }
        if let Err(err) = self.conn.submit_call(&call) {
            if let Some((slot, _)) = self.pending.resolve(&key) {
                fail(slot, err);
            }
        }
    }

    /// Received a response to a request.
    fn on_response(&mut self, resp: Response) {
        let key = resp.key();
        let Some((req, method)) = self.pending.resolve(&key) else {
            tracing::warn!(%key, "response for unknown message key, dropping");
            return;
        };
        tracing::trace!(%key, %method, "resolved");

        match req {
            PendingRequest::External(tx) => {
                let _ = tx.send(Ok(resp));
            }
            PendingRequest::CreateSession { target_id, tx } => {
                if let Some(err) = resp.error {
                    let _ = tx.send(Err(err.into()));
                    return;
                }
                match result_str(&resp.result, "sessionId") {
                    Some(id) => {
                        let session_id = SessionId::from(id);
                        // the attachedToTarget event may have adopted it first
                        self.sessions.entry(session_id.clone()).or_insert_with(|| {
                            Session::new(session_id.clone(), target_id.clone())
                        });
                        if let Some(target) = self.targets.get_mut(&target_id) {
                            target.push_session(session_id.clone());
                        }
                        tracing::debug!(session = %session_id, target = %target_id, "session attached");
                        let _ = tx.send(Ok(session_id));
                    }
                    None => {
                        let _ = tx.send(Err(CdpError::msg(
                            "attach response carried no sessionId",
                        )));
                    }
                }
            }
            PendingRequest::CloseSession { session_id, tx } => {
                self.remove_session(&session_id);
                match resp.error {
                    Some(ref err) => {
                        let _ = tx.send(Err(err.clone().into()));
                    }
                    None => {
                        let _ = tx.send(Ok(resp));
                    }
                }
            }
            PendingRequest::CreateTarget(tx) => {
                if let Some(err) = resp.error {
                    let _ = tx.send(Err(err.into()));
                    return;
                }
                match result_str(&resp.result, "targetId") {
                    Some(id) => {
                        let target_id = TargetId::from(id);
                        self.targets
                            .insert(target_id.clone(), Target::new(target_id.clone()));
                        tracing::debug!(target = %target_id, "target created");
                        let _ = tx.send(Ok(target_id));
                    }
                    None => {
                        let _ = tx.send(Err(CdpError::msg(
                            "createTarget response carried no targetId",
                        )));
                    }
                }
            }
            PendingRequest::CloseTarget { target_id, tx } => {
                if let Some(err) = resp.error.clone() {
                    let _ = tx.send(Err(err.into()));
                    return;
                }
                self.remove_target(&target_id);
                let _ = tx.send(Ok(resp));
            }
            PendingRequest::FetchTargets(tx) => {
                if let Some(err) = resp.error {
                    let _ = tx.send(Err(err.into()));
                    return;
                }
                let infos = resp
                    .result
                    .as_ref()
                    .and_then(|r| r.get("targetInfos"))
                    .and_then(|t| t.as_array())
                    .cloned();
                match infos {
                    Some(infos) => {
                        let _ = tx.send(Ok(infos));
                    }
                    None => {
                        let _ = tx.send(Err(CdpError::msg(
                            "getTargets response carried no targetInfos",
                        )));
                    }
                }
            }
            PendingRequest::CloseBrowser(tx) => {
                self.closing = true;
                let _ = tx.send(Ok(resp));
            }
        }
    }

    /// Process an incoming event: broker-level target bookkeeping first,
    /// then delivery to the owning session's subscribers.
    fn on_event(&mut self, event: Event) {
        match event.method.as_str() {
            "Target.attachedToTarget" => {
                let session_id = event
                    .param("sessionId")
                    .and_then(|v| v.as_str())
                    .map(SessionId::from);
                let target_id = event
                    .param("targetInfo")
                    .and_then(|info| info.get("targetId"))
                    .and_then(|v| v.as_str())
                    .map(TargetId::from);
                if let (Some(session_id), Some(target_id)) = (session_id, target_id) {
                    self.adopt_session(session_id, target_id);
                }
            }
            "Target.detachedFromTarget" => {
                if let Some(id) = event.param("sessionId").and_then(|v| v.as_str()) {
                    self.remove_session(&SessionId::from(id));
                }
            }
            "Target.targetDestroyed" => {
                if let Some(id) = event.param("targetId").and_then(|v| v.as_str()) {
                    let target_id = TargetId::from(id);
                    if self.targets.contains_key(&target_id) {
                        self.remove_target(&target_id);
                    }
                }
            }
            _ => {}
        }

        let session_id = event.session_id();
        match self.sessions.get_mut(&session_id) {
            Some(session) => {
                let event = std::sync::Arc::new(event);
                session.subscriptions.dispatch(&event);
            }
            None => {
                tracing::warn!(
                    session = %session_id,
                    method = %event.method,
                    "event for unknown session, dropping"
                );
            }
        }
    }

    /// Track a session the browser attached on its own initiative.
    fn adopt_session(&mut self, session_id: SessionId, target_id: TargetId) {
        if self.sessions.contains_key(&session_id) {
            return;
        }
        self.targets
            .entry(target_id.clone())
            .or_insert_with(|| Target::new(target_id.clone()))
            .push_session(session_id.clone());
        self.sessions.insert(
            session_id.clone(),
            Session::new(session_id.clone(), target_id),
        );
        tracing::debug!(session = %session_id, "session adopted from attach event");
    }

    /// Drop a session record and fail whatever it still had in flight.
    fn remove_session(&mut self, session_id: &SessionId) {
        if let Some(session) = self.sessions.remove(session_id) {
            if let Some(target) = self.targets.get_mut(session.target_id()) {
                target.remove_session(session_id);
            }
            tracing::debug!(session = %session.session_id(), "session detached");
        }
        for (slot, _) in self.pending.drain_session(session_id) {
            fail(slot, CdpError::Detached);
        }
    }

    fn remove_target(&mut self, target_id: &TargetId) {
        if let Some(target) = self.targets.remove(target_id) {
            for session_id in target.session_ids().to_vec() {
                self.remove_session(&session_id);
            }
            tracing::debug!(target = %target.target_id(), "target destroyed");
        }
    }

    /// Fail every outstanding slot; the factory runs once per waiter.
    fn drain_pending(&mut self, make: impl Fn() -> CdpError) {
        for (slot, method) in self.pending.drain() {
            tracing::debug!(%method, "draining pending command");
            fail(slot, make());
        }
    }

    fn shut_down(&mut self, make: impl Fn() -> CdpError) {
        self.closing = true;
        self.drain_pending(make);
        self.sessions.clear();
        self.targets.clear();
        self.conn.close();
    }
}

impl Stream for Handler {
    type Item = Result<()>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let pin = self.get_mut();

        loop {
            if pin.closing {
                return Poll::Ready(None);
            }

            while let Poll::Ready(Some(msg)) = Pin::new(&mut pin.from_browser).poll_next(cx) {
                pin.on_handler_message(msg);
            }

            match Pin::new(&mut pin.conn).poll_next(cx) {
                Poll::Ready(Some(Ok(CdpMessage::Response(resp)))) => {
                    pin.on_response(resp);
                    if pin.closing {
                        // Browser.close acknowledged; whatever is still in
                        // flight will never be answered
                        pin.shut_down(|| CdpError::BrowserClosed);
                        return Poll::Ready(None);
                    }
                }
                Poll::Ready(Some(Ok(CdpMessage::Event(event)))) => {
                    pin.on_event(event);
                }
                Poll::Ready(Some(Ok(CdpMessage::Goodbye))) => {
                    pin.goodbye = true;
                }
                Poll::Ready(Some(Ok(CdpMessage::GeneralError { error }))) => {
                    // an error without an id poisons the whole conversation
                    tracing::error!(%error, "fatal protocol error");
                    pin.shut_down(|| CdpError::Protocol(error.clone()));
                    return Poll::Ready(Some(Err(error.into())));
                }
                Poll::Ready(Some(Err(err))) => {
                    tracing::error!(%err, "connection error");
                    pin.shut_down(|| CdpError::BrowserClosed);
                    return Poll::Ready(Some(Err(err)));
                }
                Poll::Ready(None) => {
                    if !pin.goodbye {
                        tracing::warn!("pipe closed without the goodbye sentinel");
                    }
                    pin.shut_down(|| CdpError::BrowserClosed);
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Resolve a slot with an error, whatever kind of waiter sits behind it.
fn fail(slot: PendingRequest, err: CdpError) {
    match slot {
        PendingRequest::External(tx) => {
            let _ = tx.send(Err(err));
        }
        PendingRequest::CreateSession { tx, .. } => {
            let _ = tx.send(Err(err));
        }
        PendingRequest::CloseSession { tx, .. } => {
            let _ = tx.send(Err(err));
        }
        PendingRequest::CreateTarget(tx) => {
            let _ = tx.send(Err(err));
        }
        PendingRequest::CloseTarget { tx, .. } => {
            let _ = tx.send(Err(err));
        }
        PendingRequest::FetchTargets(tx) => {
            let _ = tx.send(Err(err));
        }
        PendingRequest::CloseBrowser(tx) => {
            let _ = tx.send(Err(err));
        }
    }
}

fn result_str<'a>(result: &'a Option<serde_json::Value>, key: &str) -> Option<&'a str> {
    result.as_ref().and_then(|r| r.get(key)).and_then(|v| v.as_str())
}

/// Different kinds of submitted requests the broker is waiting on.
#[derive(Debug)]
enum PendingRequest {
    /// A command received from a user-facing handle; the raw response goes
    /// straight back, CDP error and all.
    External(OneshotSender<Result<Response>>),
    /// A `Target.attachToTarget` the broker issued; tracks the target the
    /// new session belongs to.
    CreateSession {
        target_id: TargetId,
        tx: OneshotSender<Result<SessionId>>,
    },
    /// A `Target.detachFromTarget`; the session record goes away with the
    /// acknowledgement.
    CloseSession {
        session_id: SessionId,
        tx: OneshotSender<Result<Response>>,
    },
    /// A `Target.createTarget`.
    CreateTarget(OneshotSender<Result<TargetId>>),
    /// A `Target.closeTarget`.
    CloseTarget {
        target_id: TargetId,
        tx: OneshotSender<Result<Response>>,
    },
    /// A `Target.getTargets`; resolves with the raw `targetInfos` array.
    FetchTargets(OneshotSender<Result<Vec<serde_json::Value>>>),
    /// A `Browser.close`.
    CloseBrowser(OneshotSender<Result<Response>>),
}

/// Messages used by the user-facing handles to communicate with the broker,
/// which executes in the background.
#[derive(Debug)]
pub(crate) enum HandlerMessage {
    Command(CommandMessage),
    Subscribe {
        session_id: SessionId,
        pattern: String,
        sink: SubscriptionSink,
    },
    Unsubscribe {
        session_id: SessionId,
        pattern: String,
    },
    CreateSession {
        target_id: TargetId,
        tx: OneshotSender<Result<SessionId>>,
    },
    CloseSession {
        session_id: SessionId,
        tx: OneshotSender<Result<Response>>,
    },
    CreateTarget {
        params: serde_json::Value,
        tx: OneshotSender<Result<TargetId>>,
    },
    CloseTarget {
        target_id: TargetId,
        tx: OneshotSender<Result<Response>>,
    },
    FetchTargets(OneshotSender<Result<Vec<serde_json::Value>>>),
    CloseBrowser(OneshotSender<Result<Response>>),
}
