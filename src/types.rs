use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CdpError, Result};

pub type MethodId = Cow<'static, str>;

/// Upper bound for a single encoded frame. Anything larger is refused before
/// it reaches the pipe.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Final frame emitted by the launcher shim right before the child exits.
/// Not JSON; marks the following EOF as a clean close.
pub const GOODBYE_FRAME: &[u8] = b"{bye}";

/// Identifier for a request sent to the chromium instance.
///
/// Identifiers are allocated monotonically per session; the pair of session
/// and [`CallId`] must be unique among all in-flight requests.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(u64);

impl CallId {
    pub fn new(id: u64) -> Self {
        CallId(id)
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CallId({})", self.0)
    }
}

/// The identifier of an attached session.
///
/// The empty string denotes the implicit browser-level session that exists
/// without any `Target.attachToTarget` exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// The implicit browser-level session.
    pub fn browser() -> Self {
        SessionId(String::new())
    }

    pub fn is_browser(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        SessionId(id)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        SessionId(id.to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The identifier of a debuggable target. `"0"` is the pseudo-id of the
/// browser itself and never originates from the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetId(String);

impl TargetId {
    /// The pseudo-id for the browser-level target.
    pub fn browser() -> Self {
        TargetId("0".to_string())
    }

    pub fn is_browser(&self) -> bool {
        self.0 == "0"
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for TargetId {
    fn from(id: String) -> Self {
        TargetId(id)
    }
}

impl From<&str> for TargetId {
    fn from(id: &str) -> Self {
        TargetId(id.to_string())
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Correlates a response with its outbound command: `(sessionId or "", id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageKey {
    pub session_id: SessionId,
    pub id: CallId,
}

impl MessageKey {
    pub fn new(session_id: impl Into<SessionId>, id: CallId) -> Self {
        Self {
            session_id: session_id.into(),
            id,
        }
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:?}, {})", self.session_id.as_str(), self.id)
    }
}

/// A request sent by the client, identified by the `(session, id)` pair.
#[derive(Serialize, Debug, PartialEq, Eq)]
pub struct MethodCall {
    pub id: CallId,
    pub method: MethodId,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl MethodCall {
    pub fn key(&self) -> MessageKey {
        MessageKey {
            session_id: self.session_id.clone().unwrap_or_default(),
            id: self.id,
        }
    }
}

/// A response to a [`MethodCall`] from the chromium instance.
///
/// `result` and `error` are both kept raw: a per-request CDP error is data
/// the caller inspects, not a failure of the transport.
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone)]
pub struct Response {
    pub id: CallId,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Error>,
}

impl Response {
    pub fn key(&self) -> MessageKey {
        MessageKey {
            session_id: self.session_id.clone().unwrap_or_default(),
            id: self.id,
        }
    }
}

/// An event pushed by the chromium instance; has a `method` but no `id`.
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone)]
pub struct Event {
    pub method: String,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl Event {
    /// The session table this event belongs to; events without a
    /// `sessionId` address the browser-level session.
    pub fn session_id(&self) -> SessionId {
        self.session_id.clone().unwrap_or_default()
    }

    pub fn param(&self, key: &str) -> Option<&serde_json::Value> {
        self.params.as_ref().and_then(|p| p.get(key))
    }
}

/// The error payload the chromium instance attaches to failed requests and,
/// without an `id`, to fatal protocol-level conditions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Error {
    pub code: i64,
    pub message: String,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for Error {}

/// An incoming frame, classified by field presence: a response carries an
/// `id`, an event carries a `method` and no `id`, and a message with neither
/// but an `error` is a fatal protocol-level error.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum CdpMessage {
    Response(Response),
    Event(Event),
    GeneralError { error: Error },
    /// The shim's `{bye}` sentinel; produced by [`decode`] only.
    Goodbye,
}

/// Encode a command into its wire form (the NUL delimiter is applied by the
/// pipe, not here).
pub fn encode(call: &MethodCall) -> Result<Vec<u8>> {
    validate_method(&call.method)?;
    if let Some(params) = call.params.as_ref() {
        if contains_nul(params) {
            return Err(CdpError::MessageType(
                "command params contain a NUL byte, which collides with the frame delimiter",
            ));
        }
    }
    let bytes = serde_json::to_vec(call)?;
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(CdpError::MessageType("encoded command exceeds 16 MiB"));
    }
    Ok(bytes)
}

/// Decode a single raw frame.
///
/// Empty frames and non-object roots are [`CdpError::MalformedFrame`]; the
/// literal `{bye}` body becomes [`CdpMessage::Goodbye`].
pub fn decode(bytes: &[u8]) -> Result<CdpMessage> {
    if bytes == GOODBYE_FRAME {
        return Ok(CdpMessage::Goodbye);
    }
    if bytes.is_empty() {
        return Err(CdpError::MalformedFrame("empty frame".to_string()));
    }
    let value: serde_json::Value = serde_json::from_slice(bytes)
        .map_err(|err| CdpError::MalformedFrame(err.to_string()))?;
    if !value.is_object() {
        return Err(CdpError::MalformedFrame(format!(
            "frame root is not an object: {value}"
        )));
    }
    serde_json::from_value(value).map_err(|err| CdpError::MalformedFrame(err.to_string()))
}

/// Validate the shape of a raw command object the way the broker does before
/// anything touches the pipe.
pub fn validate_message(value: &serde_json::Value) -> Result<()> {
    let obj = value
        .as_object()
        .ok_or(CdpError::MessageType("command must be a JSON object"))?;
    let method = obj.get("method").ok_or(CdpError::MissingKey("method"))?;
    match method.as_str() {
        Some(m) => validate_method(m)?,
        None => return Err(CdpError::MessageType("method must be a string")),
    }
    if !obj.contains_key("id") {
        return Err(CdpError::MissingKey("id"));
    }
    if let Some(params) = obj.get("params") {
        if !params.is_object() {
            return Err(CdpError::MessageType("params must be an object"));
        }
    }
    Ok(())
}

pub(crate) fn validate_method(method: &str) -> Result<()> {
    if method.is_empty() {
        return Err(CdpError::MessageType("method must be a non-empty string"));
    }
    if method.contains('\0') {
        return Err(CdpError::MessageType("method contains a NUL byte"));
    }
    Ok(())
}

fn contains_nul(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::String(s) => s.contains('\0'),
        serde_json::Value::Array(items) => items.iter().any(contains_nul),
        serde_json::Value::Object(map) => map
            .iter()
            .any(|(k, v)| k.contains('\0') || contains_nul(v)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn call(method: &str, params: serde_json::Value) -> MethodCall {
        MethodCall {
            id: CallId::new(1),
            method: method.to_string().into(),
            session_id: Some("ABC".into()),
            params: Some(params),
        }
    }

    #[test]
    fn round_trip_contains_no_nul() {
        let cmd = call("Page.navigate", json!({"url": "https://example.com"}));
        let bytes = encode(&cmd).unwrap();
        assert!(!bytes.contains(&0u8));

        let decoded = decode(&bytes).unwrap();
        // An outbound command decodes as a response shape (it has an id);
        // the json must survive unchanged.
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value, serde_json::to_value(&cmd).unwrap());
        assert!(matches!(decoded, CdpMessage::Response(_)));
    }

    #[test]
    fn browser_session_omits_session_field() {
        let cmd = MethodCall {
            id: CallId::new(0),
            method: "Target.getTargets".into(),
            session_id: None,
            params: None,
        };
        let bytes = encode(&cmd).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(value.get("sessionId").is_none());
        assert!(value.get("params").is_none());
    }

    #[test]
    fn nul_in_params_is_refused() {
        let cmd = call("Runtime.evaluate", json!({"expression": "a\0b"}));
        assert!(matches!(encode(&cmd), Err(CdpError::MessageType(_))));

        let nested = call("Runtime.evaluate", json!({"args": [{"bad\0key": 1}]}));
        assert!(matches!(encode(&nested), Err(CdpError::MessageType(_))));
    }

    #[test]
    fn oversized_command_is_refused() {
        let blob = "x".repeat(MAX_MESSAGE_SIZE);
        let cmd = call("Page.navigate", json!({ "url": blob }));
        assert!(matches!(encode(&cmd), Err(CdpError::MessageType(_))));
    }

    #[test]
    fn classifies_response_event_and_general_error() {
        let resp = decode(br#"{"id":3,"sessionId":"S","result":{}}"#).unwrap();
        match resp {
            CdpMessage::Response(r) => {
                assert_eq!(r.key(), MessageKey::new("S", CallId::new(3)));
            }
            other => panic!("expected response, got {other:?}"),
        }

        let event = decode(br#"{"method":"Page.loadEventFired","params":{"timestamp":1}}"#).unwrap();
        match event {
            CdpMessage::Event(ev) => {
                assert_eq!(ev.method, "Page.loadEventFired");
                assert!(ev.session_id().is_browser());
            }
            other => panic!("expected event, got {other:?}"),
        }

        let fatal = decode(br#"{"error":{"code":-32700,"message":"Message must be an object"}}"#)
            .unwrap();
        match fatal {
            CdpMessage::GeneralError { error } => assert_eq!(error.code, -32700),
            other => panic!("expected general error, got {other:?}"),
        }
    }

    #[test]
    fn goodbye_and_garbage_frames() {
        assert_eq!(decode(b"{bye}").unwrap(), CdpMessage::Goodbye);
        assert!(matches!(decode(b""), Err(CdpError::MalformedFrame(_))));
        assert!(matches!(decode(b"[1,2]"), Err(CdpError::MalformedFrame(_))));
        assert!(matches!(decode(b"not json"), Err(CdpError::MalformedFrame(_))));
    }

    #[test]
    fn raw_message_validation() {
        assert!(validate_message(&json!({"id": 0, "method": "Browser.getVersion"})).is_ok());
        assert!(matches!(
            validate_message(&json!({"id": 0, "method": 12345})),
            Err(CdpError::MessageType(_))
        ));
        assert!(matches!(
            validate_message(&json!({"id": 0})),
            Err(CdpError::MissingKey("method"))
        ));
        assert!(matches!(
            validate_message(&json!({"method": "Browser.getVersion"})),
            Err(CdpError::MissingKey("id"))
        ));
        assert!(matches!(
            validate_message(&json!({"id": 0, "method": "M", "params": 7})),
            Err(CdpError::MessageType(_))
        ));
    }
}
