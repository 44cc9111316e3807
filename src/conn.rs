use std::pin::Pin;
use std::sync::mpsc as blocking_mpsc;

use futures::channel::mpsc;
use futures::stream::Stream;
use futures::task::{Context, Poll};

use crate::error::{CdpError, Result};
use crate::pipe::Pipe;
use crate::types::{self, CdpMessage, MethodCall};

/// Exchanges frames with the browser over the pipe transport.
///
/// Blocking pipe I/O never runs on the async scheduler: a reader worker
/// pulls and decodes frames into a channel this type polls as a [`Stream`],
/// and a writer worker drains an outgoing queue. Funneling every write
/// through the single worker is what serializes concurrent senders, so two
/// commands can never interleave bytes within a frame.
#[must_use = "streams do nothing unless polled"]
#[derive(Debug)]
pub struct Connection {
    /// Decoded frames arriving from the reader worker.
    incoming: mpsc::UnboundedReceiver<Result<CdpMessage>>,
    /// Encoded frames on their way to the writer worker.
    outgoing: Option<blocking_mpsc::Sender<Vec<u8>>>,
}

impl Connection {
    /// Take ownership of the transport and start both workers. Must be
    /// called from within a tokio runtime.
    pub fn new(pipe: Pipe) -> Self {
        let (mut reader, mut writer) = pipe.split();
        let (in_tx, incoming) = mpsc::unbounded();
        let (outgoing, out_rx) = blocking_mpsc::channel::<Vec<u8>>();

        tokio::task::spawn_blocking(move || {
            loop {
                match reader.read_frames() {
                    Ok(frames) => {
                        for frame in frames {
                            match types::decode(&frame) {
                                Ok(msg) => {
                                    tracing::trace!(?msg, "received");
                                    if in_tx.unbounded_send(Ok(msg)).is_err() {
                                        return;
                                    }
                                }
                                Err(CdpError::MalformedFrame(err)) => {
                                    tracing::warn!(%err, "dropping malformed frame");
                                }
                                Err(err) => {
                                    let _ = in_tx.unbounded_send(Err(err));
                                    return;
                                }
                            }
                        }
                    }
                    Err(CdpError::PipeClosed) => break,
                    Err(err) => {
                        let _ = in_tx.unbounded_send(Err(err));
                        break;
                    }
                }
            }
            // dropping in_tx ends the stream, which the broker reads as the
            // pipe having closed
        });

        tokio::task::spawn_blocking(move || {
            while let Ok(bytes) = out_rx.recv() {
                if let Err(err) = writer.write_frame(&bytes) {
                    tracing::warn!(%err, "pipe write failed, stopping writer");
                    break;
                }
            }
            writer.close();
        });

        Self {
            incoming,
            outgoing: Some(outgoing),
        }
    }

    /// Encode the call and queue it for the writer worker.
    ///
    /// Validation failures (NUL bytes, oversized payloads) surface here
    /// before anything reaches the pipe.
    pub fn submit_call(&mut self, call: &MethodCall) -> Result<()> {
        let bytes = types::encode(call)?;
        tracing::trace!(method = %call.method, key = %call.key(), "sending");
        match self.outgoing.as_ref() {
            Some(tx) => tx.send(bytes).map_err(|_| CdpError::PipeClosed),
            None => Err(CdpError::PipeClosed),
        }
    }

    /// Stop the writer worker. The reader worker ends on its own once the
    /// child exits and the pipe reports EOF.
    pub fn close(&mut self) {
        self.outgoing.take();
    }
}

impl Stream for Connection {
    type Item = Result<CdpMessage>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().incoming).poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};

    use futures::StreamExt;
    use serde_json::json;

    use super::*;
    use crate::types::CallId;

    fn test_conn() -> (Connection, os_pipe::PipeReader, os_pipe::PipeWriter) {
        // far ends stand in for the browser
        let (browser_reader, parent_writer) = os_pipe::pipe().unwrap();
        let (parent_reader, browser_writer) = os_pipe::pipe().unwrap();
        let conn = Connection::new(Pipe::from_raw(parent_reader, parent_writer));
        (conn, browser_reader, browser_writer)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn frames_flow_both_ways() {
        let (mut conn, mut browser_reader, mut browser_writer) = test_conn();

        conn.submit_call(&MethodCall {
            id: CallId::new(0),
            method: "Browser.getVersion".into(),
            session_id: None,
            params: None,
        })
        .unwrap();

        let raw = tokio::task::spawn_blocking(move || {
            let mut buf = Vec::new();
            let mut byte = [0u8; 1];
            loop {
                browser_reader.read_exact(&mut byte).unwrap();
                if byte[0] == 0 {
                    break;
                }
                buf.push(byte[0]);
            }
            buf
        })
        .await
        .unwrap();
        let sent: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(sent["method"], "Browser.getVersion");

        browser_writer
            .write_all(b"{\"id\":0,\"result\":{\"product\":\"Chrome\"}}\0")
            .unwrap();
        match conn.next().await.unwrap().unwrap() {
            CdpMessage::Response(resp) => {
                assert_eq!(resp.result.unwrap()["product"], json!("Chrome"));
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn malformed_frames_are_skipped() {
        let (mut conn, _browser_reader, mut browser_writer) = test_conn();

        browser_writer.write_all(b"\0garbage\0{bye}\0").unwrap();
        drop(browser_writer);

        // the empty and garbage frames are dropped; the sentinel and the
        // end-of-stream survive
        assert_eq!(conn.next().await.unwrap().unwrap(), CdpMessage::Goodbye);
        assert!(conn.next().await.is_none());
    }
}
