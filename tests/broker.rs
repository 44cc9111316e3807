//! End-to-end broker scenarios against a scripted browser sitting on the far
//! ends of a real pipe pair.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::thread;

use futures::StreamExt;
use serde_json::{json, Value};

use chromepipe::pipe::Pipe;
use chromepipe::{Browser, CdpError, Handler};

/// The far side of the transport: writes frames the way the real child does.
struct FrameSink {
    writer: Option<os_pipe::PipeWriter>,
    /// Set once the script decided to "exit the browser".
    done: bool,
}

impl FrameSink {
    fn send(&mut self, value: &Value) {
        self.send_raw(serde_json::to_vec(value).unwrap().as_slice());
    }

    fn send_raw(&mut self, bytes: &[u8]) {
        if let Some(writer) = self.writer.as_mut() {
            let _ = writer.write_all(bytes);
            let _ = writer.write_all(&[0]);
            let _ = writer.flush();
        }
    }

    /// Emit the shim's farewell and close the write end.
    fn goodbye(&mut self) {
        self.send_raw(b"{bye}");
        self.writer.take();
        self.done = true;
    }
}

/// Drive a scripted browser on its own thread. The script gets every parsed
/// command and the sink to answer through; the thread exits once the script
/// said goodbye or the client hung up.
fn scripted_browser<F>(
    mut script: F,
) -> (Browser, tokio::task::JoinHandle<Option<CdpError>>, thread::JoinHandle<()>)
where
    F: FnMut(Value, &mut FrameSink) + Send + 'static,
{
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .try_init();

    let (browser_reader, parent_writer) = os_pipe::pipe().unwrap();
    let (parent_reader, browser_writer) = os_pipe::pipe().unwrap();

    let fake = thread::spawn(move || {
        let mut reader = browser_reader;
        let mut sink = FrameSink {
            writer: Some(browser_writer),
            done: false,
        };
        let mut buf: Vec<u8> = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            while let Some(pos) = buf.iter().position(|b| *b == 0) {
                let frame: Vec<u8> = buf.drain(..=pos).collect();
                let frame = &frame[..frame.len() - 1];
                if frame.is_empty() {
                    continue;
                }
                let cmd: Value = serde_json::from_slice(frame).unwrap();
                script(cmd, &mut sink);
            }
            if sink.done {
                return;
            }
            match reader.read(&mut chunk) {
                Ok(0) | Err(_) => return,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        }
    });

    let (browser, mut handler) = Browser::attach(Pipe::from_raw(parent_reader, parent_writer));
    let handler_task = tokio::spawn(async move {
        let mut fatal = None;
        while let Some(res) = next_item(&mut handler).await {
            if let Err(err) = res {
                fatal = Some(err);
                break;
            }
        }
        fatal
    });

    (browser, handler_task, fake)
}

async fn next_item(handler: &mut Handler) -> Option<chromepipe::Result<()>> {
    handler.next().await
}

/// A scripted browser that behaves like the real thing for the target and
/// session bookkeeping, records every method it saw, and echoes `Page.*`
/// commands back as events on the same session.
fn default_script(
    received: Arc<Mutex<Vec<String>>>,
) -> impl FnMut(Value, &mut FrameSink) + Send + 'static {
    let mut attach_seq = 0u32;
    move |cmd, sink| {
        let method = cmd["method"].as_str().unwrap_or_default().to_string();
        received.lock().unwrap().push(method.clone());

        let id = cmd["id"].clone();
        let session = cmd.get("sessionId").cloned();
        let respond = |sink: &mut FrameSink, body: Value| {
            let mut msg = json!({ "id": id });
            if let Some(ref s) = session {
                msg["sessionId"] = s.clone();
            }
            for (k, v) in body.as_object().unwrap() {
                msg[k] = v.clone();
            }
            sink.send(&msg);
        };

        match method.as_str() {
            "Browser.close" => {
                respond(sink, json!({ "result": {} }));
                sink.goodbye();
            }
            "Target.getTargets" => {
                respond(
                    sink,
                    json!({ "result": { "targetInfos": [
                        { "targetId": "PAGE-1", "type": "page", "title": "",
                          "url": "about:blank", "attached": false },
                        { "targetId": "WORKER-1", "type": "service_worker", "title": "",
                          "url": "chrome://worker", "attached": false },
                    ]}}),
                );
            }
            "Target.createTarget" => {
                respond(sink, json!({ "result": { "targetId": "PAGE-NEW" } }));
            }
            "Target.closeTarget" => {
                respond(sink, json!({ "result": { "success": true } }));
            }
            "Target.attachToTarget" => {
                let target_id = cmd["params"]["targetId"].as_str().unwrap();
                assert_eq!(cmd["params"]["flatten"], json!(true));
                attach_seq += 1;
                let session_id = format!("SESS-{target_id}-{attach_seq}");
                sink.send(&json!({
                    "method": "Target.attachedToTarget",
                    "params": {
                        "sessionId": session_id,
                        "targetInfo": { "targetId": target_id, "type": "page" },
                        "waitingForDebugger": false,
                    }
                }));
                respond(sink, json!({ "result": { "sessionId": session_id } }));
            }
            "Target.detachFromTarget" => {
                let session_id = cmd["params"]["sessionId"].clone();
                respond(sink, json!({ "result": {} }));
                sink.send(&json!({
                    "method": "Target.detachedFromTarget",
                    "params": { "sessionId": session_id },
                }));
            }
            "Fatal.now" => {
                sink.send(&json!({
                    "error": { "code": -32700, "message": "simulated broker failure" }
                }));
                sink.done = true;
                sink.writer.take();
            }
            "Hang.forever" => {
                // never answered; the response arrives as a drain error
            }
            m if m.starts_with("Page.") => {
                respond(sink, json!({ "result": {} }));
                let mut event = json!({ "method": m, "params": {} });
                if let Some(ref s) = session {
                    event["sessionId"] = s.clone();
                }
                sink.send(&event);
            }
            _ => {
                respond(
                    sink,
                    json!({ "error": {
                        "code": -32601,
                        "message": format!("'{method}' wasn't found"),
                    }}),
                );
            }
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn send_and_await_get_targets() {
    let received = Arc::new(Mutex::new(Vec::new()));
    let (mut browser, handler_task, fake) = scripted_browser(default_script(received.clone()));

    let response = browser
        .send_command("Target.getTargets", None)
        .await
        .unwrap();
    assert!(response.error.is_none());
    let infos = response.result.unwrap()["targetInfos"].clone();
    let infos = infos.as_array().unwrap();
    assert!(!infos.is_empty());
    for info in infos {
        assert!(info["targetId"].is_string());
        let kind = info["type"].as_str().unwrap();
        assert!(
            ["page", "background_page", "service_worker", "browser", "other"].contains(&kind)
        );
    }

    browser.close().await.unwrap();
    assert!(handler_task.await.unwrap().is_none());
    fake.join().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_commands_never_touch_the_pipe() {
    let received = Arc::new(Mutex::new(Vec::new()));
    let (mut browser, handler_task, fake) = scripted_browser(default_script(received.clone()));

    let err = browser.send_command("", None).await.unwrap_err();
    assert!(matches!(err, CdpError::MessageType(_)));

    let err = browser
        .send_command("Page.navigate", Some(json!("not an object")))
        .await
        .unwrap_err();
    assert!(matches!(err, CdpError::MessageType(_)));

    browser.close().await.unwrap();
    handler_task.await.unwrap();
    fake.join().unwrap();

    // the interposed transport saw only the shutdown command
    assert_eq!(*received.lock().unwrap(), vec!["Browser.close".to_string()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_method_resolves_with_negative_error_code() {
    let received = Arc::new(Mutex::new(Vec::new()));
    let (mut browser, handler_task, fake) = scripted_browser(default_script(received.clone()));

    let response = browser.send_command("dkadklqwmd", None).await.unwrap();
    let error = response.error.expect("server reports unknown methods");
    assert!(error.code < 0);

    browser.close().await.unwrap();
    handler_task.await.unwrap();
    fake.join().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn subscribe_once_fires_exactly_once() {
    let received = Arc::new(Mutex::new(Vec::new()));
    let (mut browser, handler_task, fake) = scripted_browser(default_script(received.clone()));

    browser.populate_targets().await.unwrap();
    let tab = browser.get_tab_mut().expect("populated one page target");
    let session = tab.session().unwrap().clone();

    let next = session.subscribe_once("Page.*").unwrap();
    session.send_command("Page.enable", None).await.unwrap();
    session.send_command("Page.reload", None).await.unwrap();

    let event = next.await.unwrap();
    assert!(event.method.starts_with("Page."));

    // the one-shot is consumed: further matching events go nowhere, and the
    // session keeps working
    let response = session.send_command("Page.enable", None).await.unwrap();
    assert!(response.error.is_none());

    browser.close().await.unwrap();
    handler_task.await.unwrap();
    fake.join().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn subscribe_and_unsubscribe() {
    let received = Arc::new(Mutex::new(Vec::new()));
    let (mut browser, handler_task, fake) = scripted_browser(default_script(received.clone()));

    browser.populate_targets().await.unwrap();
    let tab = browser.get_tab_mut().unwrap();
    let session = tab.session().unwrap().clone();

    let mut events = session.subscribe("Page.*").unwrap();
    session.send_command("Page.enable", None).await.unwrap();
    session.send_command("Page.reload", None).await.unwrap();

    assert_eq!(events.next().await.unwrap().method, "Page.enable");
    assert_eq!(events.next().await.unwrap().method, "Page.reload");

    session.unsubscribe("Page.*").unwrap();
    session.send_command("Page.enable", None).await.unwrap();
    session.send_command("Page.reload", None).await.unwrap();

    // removing the table entry dropped the sender, so the stream ends
    // instead of seeing the later events
    assert!(events.next().await.is_none());

    browser.close().await.unwrap();
    handler_task.await.unwrap();
    fake.join().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn session_isolation_across_targets() {
    let received = Arc::new(Mutex::new(Vec::new()));
    let (mut browser, handler_task, fake) = scripted_browser(default_script(received.clone()));

    browser.populate_targets().await.unwrap();
    let session_a = browser.get_tab().unwrap().session().unwrap().clone();
    let tab_b = browser.create_tab("about:blank", None, None).await.unwrap();
    let session_b = tab_b.session().unwrap().clone();
    assert_ne!(session_a.session_id(), session_b.session_id());

    let mut events_a = session_a.subscribe("Page.*").unwrap();

    // only session B emits; A's subscription must stay silent
    session_b.send_command("Page.enable", None).await.unwrap();
    session_a.send_command("Page.reload", None).await.unwrap();

    // the first event A sees is its own, not B's
    assert_eq!(events_a.next().await.unwrap().method, "Page.reload");

    browser.close().await.unwrap();
    handler_task.await.unwrap();
    fake.join().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn session_lifecycle() {
    let received = Arc::new(Mutex::new(Vec::new()));
    let (mut browser, handler_task, fake) = scripted_browser(default_script(received.clone()));

    browser.populate_targets().await.unwrap();
    let tab = browser.get_tab_mut().unwrap();
    assert_eq!(tab.sessions().len(), 1);

    let session = tab.create_session().await.unwrap();
    let session_id = session.session_id().clone();
    assert!(tab
        .sessions()
        .iter()
        .any(|s| s.session_id() == &session_id));

    tab.close_session(session_id.clone()).await.unwrap();
    assert!(!tab
        .sessions()
        .iter()
        .any(|s| s.session_id() == &session_id));

    // the broker no longer knows the session
    let err = session.send_command("Page.enable", None).await.unwrap_err();
    assert!(matches!(err, CdpError::BrowserClosed));

    browser.close().await.unwrap();
    handler_task.await.unwrap();
    fake.join().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_drains_pending_commands() {
    let received = Arc::new(Mutex::new(Vec::new()));
    let (mut browser, handler_task, fake) = scripted_browser(default_script(received.clone()));

    let hung = browser.send_command("Hang.forever", None);
    let hung = tokio::spawn(hung);
    // let the command reach the wire before shutting down
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    browser.close().await.unwrap();

    let err = hung.await.unwrap().unwrap_err();
    assert!(matches!(err, CdpError::BrowserClosed));

    assert!(handler_task.await.unwrap().is_none());
    fake.join().unwrap();

    // closing again is a no-op
    browser.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn detached_session_drains_its_pending_slots() {
    let received = Arc::new(Mutex::new(Vec::new()));
    let (mut browser, handler_task, fake) = scripted_browser(default_script(received.clone()));

    browser.populate_targets().await.unwrap();
    let tab = browser.get_tab_mut().unwrap();
    let session = tab.session().unwrap().clone();

    let hung = tokio::spawn(session.send_command("Hang.forever", None));
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    // the browser detaches the session while the command is in flight
    let detach_id = session.session_id().clone();
    tab.close_session(detach_id).await.unwrap();

    let err = hung.await.unwrap().unwrap_err();
    assert!(matches!(err, CdpError::Detached));

    browser.close().await.unwrap();
    handler_task.await.unwrap();
    fake.join().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn general_error_is_fatal_and_poisons_waiters() {
    let received = Arc::new(Mutex::new(Vec::new()));
    let (browser, handler_task, fake) = scripted_browser(default_script(received.clone()));

    let err = browser.send_command("Fatal.now", None).await.unwrap_err();
    match err {
        CdpError::BrowserClosed => {}
        CdpError::Protocol(err) => assert_eq!(err.code, -32700),
        other => panic!("expected a drained waiter, got {other:?}"),
    }

    // the broker surfaced the protocol error and stopped
    let fatal = handler_task.await.unwrap();
    match fatal {
        Some(CdpError::Protocol(err)) => assert_eq!(err.code, -32700),
        other => panic!("expected a fatal protocol error, got {other:?}"),
    }
    fake.join().unwrap();
    drop(browser);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn goodbye_then_eof_is_a_clean_close() {
    let received = Arc::new(Mutex::new(Vec::new()));
    let (mut browser, handler_task, fake) = scripted_browser(default_script(received.clone()));

    browser.close().await.unwrap();

    // the scripted browser answered Browser.close, said {bye} and hung up;
    // the broker must end without reporting an error
    assert!(handler_task.await.unwrap().is_none());
    fake.join().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn request_ids_stay_unique_per_session() {
    let received = Arc::new(Mutex::new(Vec::new()));
    let keys = Arc::new(Mutex::new(Vec::<(String, u64)>::new()));
    let keys_in_script = keys.clone();

    let mut inner = default_script(received.clone());
    let (mut browser, handler_task, fake) = scripted_browser(move |cmd, sink| {
        let session = cmd
            .get("sessionId")
            .and_then(|s| s.as_str())
            .unwrap_or_default()
            .to_string();
        let id = cmd["id"].as_u64().unwrap();
        keys_in_script.lock().unwrap().push((session, id));
        inner(cmd, sink);
    });

    browser.populate_targets().await.unwrap();
    let session = browser.get_tab().unwrap().session().unwrap().clone();
    for _ in 0..3 {
        browser
            .send_command("Target.getTargets", None)
            .await
            .unwrap();
        session.send_command("Page.enable", None).await.unwrap();
    }
    browser.close().await.unwrap();
    handler_task.await.unwrap();
    fake.join().unwrap();

    let keys = keys.lock().unwrap();
    let mut deduped = keys.clone();
    deduped.sort();
    deduped.dedup();
    assert_eq!(deduped.len(), keys.len(), "message keys must be unique: {keys:?}");
}
