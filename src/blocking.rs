//! A blocking front for the cooperative [`Browser`](crate::Browser).
//!
//! Owns a multi-threaded runtime and the spawned broker task; every call
//! here is the cooperative one driven to completion with `block_on`, so the
//! two shapes cannot drift apart semantically.

use std::future::Future;

use futures::StreamExt;

use crate::browser::BrowserConfig;
use crate::error::Result;
use crate::types::{MethodId, Response, SessionId, TargetId};

#[derive(Debug)]
pub struct Browser {
    runtime: Option<tokio::runtime::Runtime>,
    inner: crate::Browser,
}

impl Browser {
    /// Launch the browser and start the broker on a background task.
    pub fn launch(config: BrowserConfig) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?;
        let (inner, mut handler) = runtime.block_on(crate::Browser::launch(config))?;
        runtime.spawn(async move {
            while let Some(res) = handler.next().await {
                if let Err(err) = res {
                    tracing::error!(%err, "broker stopped");
                    break;
                }
            }
        });
        Ok(Self {
            runtime: Some(runtime),
            inner,
        })
    }

    fn runtime(&self) -> &tokio::runtime::Runtime {
        self.runtime
            .as_ref()
            .expect("runtime lives until the browser is dropped")
    }

    /// Drive any future of the cooperative API to completion.
    pub fn run<F: Future>(&self, fut: F) -> F::Output {
        self.runtime().block_on(fut)
    }

    /// Send a command on the browser-level session and block until its
    /// response arrives or the broker closes.
    pub fn send_command(
        &self,
        method: impl Into<MethodId>,
        params: Option<serde_json::Value>,
    ) -> Result<Response> {
        let fut = self.inner.send_command(method, params);
        self.runtime().block_on(fut)
    }

    /// Send a command on a tab's primary session.
    pub fn tab_send_command(
        &self,
        target_id: &TargetId,
        method: impl Into<MethodId>,
        params: Option<serde_json::Value>,
    ) -> Result<Response> {
        let tab = self
            .inner
            .tab(target_id)
            .ok_or(crate::error::CdpError::NotFound)?;
        let fut = tab.send_command(method, params)?;
        self.runtime().block_on(fut)
    }

    /// Block until the first event matching `pattern` arrives on the
    /// browser-level session.
    pub fn wait_for_event(
        &self,
        pattern: impl Into<String>,
    ) -> Result<std::sync::Arc<crate::types::Event>> {
        let next = self.inner.browser_session().subscribe_once(pattern)?;
        self.runtime().block_on(next)
    }

    pub fn populate_targets(&mut self) -> Result<()> {
        let Self { runtime, inner } = self;
        let rt = runtime.as_ref().expect("runtime lives until drop");
        rt.block_on(inner.populate_targets())
    }

    /// Create a tab and return its target id.
    pub fn create_tab(
        &mut self,
        url: impl Into<String>,
        width: Option<u32>,
        height: Option<u32>,
    ) -> Result<TargetId> {
        let Self { runtime, inner } = self;
        let rt = runtime.as_ref().expect("runtime lives until drop");
        let tab = rt.block_on(inner.create_tab(url, width, height))?;
        Ok(tab.target_id().clone())
    }

    pub fn close_tab(&mut self, target_id: impl Into<TargetId>) -> Result<Response> {
        let Self { runtime, inner } = self;
        let rt = runtime.as_ref().expect("runtime lives until drop");
        rt.block_on(inner.close_tab(target_id))
    }

    /// The first known tab's target id.
    pub fn get_tab(&self) -> Option<TargetId> {
        self.inner.get_tab().map(|tab| tab.target_id().clone())
    }

    /// Session ids attached to a tab, primary first.
    pub fn tab_sessions(&self, target_id: &TargetId) -> Vec<SessionId> {
        self.inner
            .tab(target_id)
            .map(|tab| {
                tab.sessions()
                    .iter()
                    .map(|s| s.session_id().clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Access the cooperative browser underneath, e.g. to combine with
    /// [`Browser::run`] for anything this front does not wrap.
    pub fn browser_mut(&mut self) -> &mut crate::Browser {
        &mut self.inner
    }

    /// Walk the shutdown cascade and remove the profile directory.
    pub fn close(&mut self) -> Result<()> {
        let Self { runtime, inner } = self;
        let rt = runtime.as_ref().expect("runtime lives until drop");
        rt.block_on(inner.close())
    }
}

impl Drop for Browser {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            let _ = runtime.block_on(self.inner.close());
            runtime.shutdown_background();
        }
    }
}
