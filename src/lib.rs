//! Drive a Chromium or Chrome (potentially headless) browser over the
//! [Chrome DevTools Protocol](https://chromedevtools.github.io/devtools-protocol/)
//! pipe transport.
//!
//! Instead of the debugging websocket, the browser is spawned with
//! `--remote-debugging-pipe` and speaks NUL-terminated JSON frames over two
//! inherited file descriptors (3 and 4). A single broker task multiplexes
//! every session over that pipe: it correlates responses with their
//! `(sessionId, id)` keys, routes events to pattern subscriptions, and tears
//! the child process and its temporary profile down on every exit path.
//!
//! # Example
//! ```no_run
//! use chromepipe::{Browser, BrowserConfig};
//! use futures::StreamExt;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (mut browser, mut handler) =
//!         Browser::launch(BrowserConfig::builder().build()?).await?;
//!
//!     let handle = tokio::task::spawn(async move {
//!         while let Some(res) = handler.next().await {
//!             if res.is_err() {
//!                 break;
//!             }
//!         }
//!     });
//!
//!     browser.populate_targets().await?;
//!     let tab = browser.create_tab("about:blank", None, None).await?;
//!     let response = tab
//!         .send_command("Page.navigate", Some(json!({"url": "https://example.com"})))?
//!         .await?;
//!     assert!(response.error.is_none());
//!
//!     browser.close().await?;
//!     let _ = handle.await;
//!     Ok(())
//! }
//! ```
//!
//! A blocking front with identical semantics lives in [`blocking`].

#![warn(missing_debug_implementations, rust_2018_idioms)]

pub mod async_process;
pub mod blocking;
pub mod browser;
pub(crate) mod cmd;
pub mod conn;
pub mod detection;
pub mod error;
pub mod handler;
pub mod listeners;
pub mod pipe;
pub mod session;
pub mod tab;
pub mod types;
pub(crate) mod utils;

pub use crate::browser::{Browser, BrowserConfig};
pub use crate::conn::Connection;
pub use crate::error::{CdpError, Result};
pub use crate::handler::{CommandFuture, Handler};
pub use crate::listeners::{EventStream, NextEvent};
pub use crate::session::Session;
pub use crate::tab::Tab;
pub use crate::types::{CallId, Event, MessageKey, Response, SessionId, TargetId};
