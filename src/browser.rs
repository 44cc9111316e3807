use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::channel::mpsc::{channel, Sender};
use futures::channel::oneshot::channel as oneshot_channel;
use futures::SinkExt;
use hashbrown::HashMap;
use serde_json::json;
use tempfile::TempDir;

use crate::async_process::{self, Child, Stdio};
use crate::conn::Connection;
use crate::detection::{self, DetectionOptions};
use crate::error::Result;
use crate::handler::{CommandFuture, Handler, HandlerMessage};
use crate::pipe::PipePair;
use crate::session::Session;
use crate::tab::Tab;
use crate::types::{MethodId, Response, SessionId, TargetId};
use crate::utils;

/// How long the browser gets to exit after `Browser.close`.
pub const GRACEFUL_EXIT_WAIT: Duration = Duration::from_secs(3);
/// How long a terminated process group gets before the hard kill.
pub const FORCE_EXIT_WAIT: Duration = Duration::from_secs(2);

/// A running chromium instance spoken to over the pipe transport.
///
/// [`Browser::launch`] returns the browser together with its [`Handler`];
/// the handler must be spawned and polled to completion for anything here to
/// make progress. Call [`Browser::close`] on every exit path: it walks the
/// shutdown cascade and removes the temporary profile directory.
#[derive(Debug)]
pub struct Browser {
    /// The `Sender` half to communicate with the broker.
    pub(crate) sender: Sender<HandlerMessage>,
    /// How the spawned chromium instance was configured, if any.
    config: Option<BrowserConfig>,
    /// The spawned chromium instance.
    child: Option<Child>,
    /// The profile directory handed to the child; owned unless the config
    /// supplied one.
    temp_dir: Option<TempDir>,
    user_data_dir: Option<PathBuf>,
    /// Sessions attached to the browser-level target, the implicit `""`
    /// session first.
    sessions: Vec<Session>,
    /// Known page targets, in creation/adoption order.
    tabs: Vec<Tab>,
    closed: bool,
}

impl Browser {
    /// Launch a new chromium instance and connect over its pipe transport.
    ///
    /// Fails when no executable could be detected or the child could not be
    /// spawned. The returned [`Handler`] must be polled (usually on its own
    /// task) for commands and events to flow.
    pub async fn launch(mut config: BrowserConfig) -> Result<(Self, Handler)> {
        // Canonicalize paths to reduce issues with sandboxing
        config.executable = utils::canonicalize_except_snap(config.executable).await?;

        let (temp_dir, user_data_dir) = match config.user_data_dir.as_ref() {
            Some(dir) => (None, dir.clone()),
            None => {
                let dir = tempfile::Builder::new()
                    .prefix("chromepipe-profile-")
                    .tempdir()?;
                let path = dir.path().to_path_buf();
                (Some(dir), path)
            }
        };

        let pair = PipePair::new()?;
        let child = config.launch(&pair, &user_data_dir)?;
        tracing::debug!(pid = ?child.id(), profile = %user_data_dir.display(), "browser spawned");

        let conn = Connection::new(pair.into_parent());
        let (tx, rx) = channel(1000);
        let handler = Handler::new(conn, rx);

        let browser_session = Session::new(SessionId::browser(), tx.clone());
        let browser = Self {
            sender: tx,
            config: Some(config),
            child: Some(child),
            temp_dir,
            user_data_dir: Some(user_data_dir),
            sessions: vec![browser_session],
            tabs: Vec::new(),
            closed: false,
        };

        Ok((browser, handler))
    }

    /// Attach to an already running browser over an existing pipe transport,
    /// e.g. handles inherited from an outer supervisor.
    ///
    /// No child process or profile directory is managed; [`Browser::close`]
    /// still asks the instance to shut down and stops the broker. Must be
    /// called from within a tokio runtime.
    pub fn attach(pipe: crate::pipe::Pipe) -> (Self, Handler) {
        let conn = Connection::new(pipe);
        let (tx, rx) = channel(1000);
        let handler = Handler::new(conn, rx);

        let browser_session = Session::new(SessionId::browser(), tx.clone());
        let browser = Self {
            sender: tx,
            config: None,
            child: None,
            temp_dir: None,
            user_data_dir: None,
            sessions: vec![browser_session],
            tabs: Vec::new(),
            closed: false,
        };
        (browser, handler)
    }

    /// The implicit browser-level session.
    pub fn browser_session(&self) -> &Session {
        &self.sessions[0]
    }

    /// The profile directory the child runs against, if one is managed.
    pub fn user_data_dir(&self) -> Option<&Path> {
        self.user_data_dir.as_deref()
    }

    /// The config of the spawned chromium instance, if any.
    pub fn config(&self) -> Option<&BrowserConfig> {
        self.config.as_ref()
    }

    /// Send a command on the browser-level session.
    ///
    /// The resolved [`Response`] carries a CDP `error` as data; the helpers
    /// below raise instead.
    pub fn send_command(
        &self,
        method: impl Into<MethodId>,
        params: Option<serde_json::Value>,
    ) -> CommandFuture {
        self.browser_session().send_command(method, params)
    }

    /// Fetch all targets the browser currently knows about, as raw
    /// `targetInfos` entries.
    pub async fn fetch_targets(&mut self) -> Result<Vec<serde_json::Value>> {
        let (tx, rx) = oneshot_channel();
        self.sender
            .clone()
            .send(HandlerMessage::FetchTargets(tx))
            .await?;
        rx.await?
    }

    /// Adopt every `page` target not yet known and attach a primary session
    /// to each.
    pub async fn populate_targets(&mut self) -> Result<()> {
        let infos = self.fetch_targets().await?;
        for info in infos {
            if info.get("type").and_then(|t| t.as_str()) != Some("page") {
                continue;
            }
            let Some(target_id) = info.get("targetId").and_then(|t| t.as_str()) else {
                continue;
            };
            let target_id = TargetId::from(target_id);
            if self.tabs.iter().any(|tab| tab.target_id() == &target_id) {
                continue;
            }
            let mut tab = Tab::new(target_id.clone(), self.sender.clone());
            tab.create_session().await?;
            self.tabs.push(tab);
            tracing::debug!(target = %target_id, "target adopted");
        }
        Ok(())
    }

    /// Create a new page target with a primary session attached.
    ///
    /// Width and height only apply to headless mode; otherwise they are
    /// dropped with a warning.
    pub async fn create_tab(
        &mut self,
        url: impl Into<String>,
        mut width: Option<u32>,
        mut height: Option<u32>,
    ) -> Result<&mut Tab> {
        let headless = self.config.as_ref().map(|c| c.headless).unwrap_or(true);
        if !headless && (width.is_some() || height.is_some()) {
            tracing::warn!("width and height only work in headless mode, they will be ignored");
            width = None;
            height = None;
        }
        let mut params = json!({ "url": url.into() });
        if let Some(width) = width {
            params["width"] = json!(width);
        }
        if let Some(height) = height {
            params["height"] = json!(height);
        }

        let (tx, rx) = oneshot_channel();
        self.sender
            .clone()
            .send(HandlerMessage::CreateTarget { params, tx })
            .await?;
        let target_id = rx.await??;

        let mut tab = Tab::new(target_id, self.sender.clone());
        tab.create_session().await?;
        self.tabs.push(tab);
        Ok(self.tabs.last_mut().expect("pushed above"))
    }

    /// Close a page target. The local tab handle goes away even when the
    /// browser reports an error for the close itself.
    pub async fn close_tab(&mut self, target_id: impl Into<TargetId>) -> Result<Response> {
        let target_id = target_id.into();
        let (tx, rx) = oneshot_channel();
        self.sender
            .clone()
            .send(HandlerMessage::CloseTarget {
                target_id: target_id.clone(),
                tx,
            })
            .await?;
        let res = rx.await?;
        self.tabs.retain(|tab| tab.target_id() != &target_id);
        res
    }

    /// The first known tab, if any.
    pub fn get_tab(&self) -> Option<&Tab> {
        self.tabs.first()
    }

    pub fn get_tab_mut(&mut self) -> Option<&mut Tab> {
        self.tabs.first_mut()
    }

    pub fn tabs(&self) -> &[Tab] {
        &self.tabs
    }

    pub fn tab(&self, target_id: &TargetId) -> Option<&Tab> {
        self.tabs.iter().find(|tab| tab.target_id() == target_id)
    }

    pub fn tab_mut(&mut self, target_id: &TargetId) -> Option<&mut Tab> {
        self.tabs.iter_mut().find(|tab| tab.target_id() == target_id)
    }

    /// Attach an extra session to the browser-level target via
    /// `Target.attachToBrowserTarget`. Only some chrome builds accept this.
    pub async fn create_session(&mut self) -> Result<Session> {
        tracing::warn!(
            "creating new sessions on the browser-level target only works with some versions of chrome, it is experimental"
        );
        let (tx, rx) = oneshot_channel();
        self.sender
            .clone()
            .send(HandlerMessage::CreateSession {
                target_id: TargetId::browser(),
                tx,
            })
            .await?;
        let session_id = rx.await??;
        let session = Session::new(session_id, self.sender.clone());
        self.sessions.push(session.clone());
        Ok(session)
    }

    /// Shut everything down: ask the browser to close, escalate to the
    /// process group and then to a hard kill if it lingers, and remove the
    /// profile directory. Runs the cleanup even when earlier steps fail, and
    /// is safe to call more than once.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let (tx, _ack) = oneshot_channel();
        let _ = self
            .sender
            .clone()
            .send(HandlerMessage::CloseBrowser(tx))
            .await;

        if let Some(child) = self.child.as_mut() {
            let already_exited = matches!(child.try_wait(), Ok(Some(_)));
            if !already_exited {
                if tokio::time::timeout(GRACEFUL_EXIT_WAIT, child.wait())
                    .await
                    .is_err()
                {
                    tracing::debug!("browser did not exit in time, terminating process group");
                    terminate_process_group(child.id());
                    if tokio::time::timeout(FORCE_EXIT_WAIT, child.wait())
                        .await
                        .is_err()
                    {
                        tracing::warn!("process group termination timed out, killing");
                        if let Err(err) = child.kill().await {
                            tracing::warn!(%err, "could not kill the browser process");
                        }
                    }
                }
            }
        }
        self.child.take();

        self.cleanup();
        Ok(())
    }

    fn cleanup(&mut self) {
        if let Some(dir) = self.temp_dir.take() {
            remove_profile_dir(dir);
        }
    }
}

impl Drop for Browser {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            if let Ok(Some(_)) = child.try_wait() {
                // already exited, usually after close or kill
            } else {
                // the child was spawned with kill_on_drop, so the runtime
                // reaps it in the background eventually
                tracing::warn!(
                    "browser was not closed manually, it will be killed automatically in the background"
                );
            }
        }
        self.cleanup();
    }
}

#[cfg(unix)]
fn terminate_process_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        unsafe {
            // the child moved itself into a fresh group, so its pid names it
            libc::kill(-(pid as libc::pid_t), libc::SIGTERM);
        }
    }
}

#[cfg(windows)]
fn terminate_process_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        let _ = std::process::Command::new("taskkill")
            .args(["/F", "/T", "/PID", &pid.to_string()])
            .output();
    }
}

fn remove_profile_dir(dir: TempDir) {
    let path = dir.path().to_path_buf();
    if let Err(err) = dir.close() {
        #[cfg(windows)]
        {
            let _ = err;
            remove_readonly_tree(&path);
        }
        #[cfg(not(windows))]
        tracing::warn!(
            path = %path.display(),
            %err,
            "the user data directory could not be deleted, execution will continue"
        );
    }
}

/// Windows marks some profile files read-only; walk the tree clearing the
/// attribute and retry the removal before giving up with a warning.
#[cfg(windows)]
fn remove_readonly_tree(path: &Path) {
    fn clear_readonly(path: &Path) -> io::Result<()> {
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            let mut perms = meta.permissions();
            if perms.readonly() {
                perms.set_readonly(false);
                let _ = std::fs::set_permissions(entry.path(), perms);
            }
            if meta.is_dir() {
                clear_readonly(&entry.path())?;
            }
        }
        Ok(())
    }

    let _ = clear_readonly(path);
    match std::fs::remove_dir_all(path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
            tracing::warn!(
                "the user data directory could not be deleted due to a permission error, execution will continue"
            );
        }
        Err(err) => {
            tracing::warn!(
                %err,
                "the user data directory could not be deleted, execution will continue"
            );
        }
    }
}

#[derive(Debug, Clone)]
pub struct BrowserConfig {
    /// Determines whether to run the browser headless. Defaults to true.
    headless: bool,
    /// Determines whether to run the browser with a sandbox.
    sandbox: bool,
    /// Path for Chrome or Chromium.
    ///
    /// If unspecified, the builder tries to automatically detect a suitable
    /// binary.
    executable: PathBuf,
    /// Additional command line arguments to pass to the browser instance.
    args: Vec<String>,
    /// Whether to disable DEFAULT_ARGS or not, default is false.
    disable_default_args: bool,
    /// Environment variables to set for the chromium process.
    process_envs: Option<HashMap<String, String>>,
    /// Data dir for user data; a scoped temporary directory when unset.
    pub user_data_dir: Option<PathBuf>,
    /// Inherit the child's stderr instead of discarding it.
    debug_browser: bool,
}

impl BrowserConfig {
    pub fn builder() -> BrowserConfigBuilder {
        BrowserConfigBuilder::default()
    }

    pub fn with_executable(path: impl AsRef<Path>) -> Result<Self, String> {
        Self::builder().chrome_executable(path).build()
    }

    pub fn headless(&self) -> bool {
        self.headless
    }
}

#[derive(Debug, Clone)]
pub struct BrowserConfigBuilder {
    headless: bool,
    sandbox: bool,
    executable: Option<PathBuf>,
    executable_detection: DetectionOptions,
    args: Vec<String>,
    disable_default_args: bool,
    process_envs: Option<HashMap<String, String>>,
    user_data_dir: Option<PathBuf>,
    debug_browser: bool,
}

impl Default for BrowserConfigBuilder {
    fn default() -> Self {
        Self {
            headless: true,
            sandbox: true,
            executable: None,
            executable_detection: DetectionOptions::default(),
            args: Vec::new(),
            disable_default_args: false,
            process_envs: None,
            user_data_dir: None,
            debug_browser: false,
        }
    }
}

impl BrowserConfigBuilder {
    pub fn with_head(mut self) -> Self {
        self.headless = false;
        self
    }

    pub fn no_sandbox(mut self) -> Self {
        self.sandbox = false;
        self
    }

    pub fn user_data_dir(mut self, data_dir: impl AsRef<Path>) -> Self {
        self.user_data_dir = Some(data_dir.as_ref().to_path_buf());
        self
    }

    pub fn chrome_executable(mut self, path: impl AsRef<Path>) -> Self {
        self.executable = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn chrome_detection(mut self, options: DetectionOptions) -> Self {
        self.executable_detection = options;
        self
    }

    /// Keep the child's stderr attached to the parent's for debugging.
    pub fn debug_browser(mut self) -> Self {
        self.debug_browser = true;
        self
    }

    pub fn env(mut self, key: impl Into<String>, val: impl Into<String>) -> Self {
        self.process_envs
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), val.into());
        self
    }

    pub fn envs<I, K, V>(mut self, envs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.process_envs
            .get_or_insert_with(HashMap::new)
            .extend(envs.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for arg in args {
            self.args.push(arg.into());
        }
        self
    }

    pub fn disable_default_args(mut self) -> Self {
        self.disable_default_args = true;
        self
    }

    pub fn build(self) -> Result<BrowserConfig, String> {
        let executable = if let Some(e) = self.executable {
            e
        } else {
            detection::default_executable(self.executable_detection)?
        };

        Ok(BrowserConfig {
            headless: self.headless,
            sandbox: self.sandbox,
            executable,
            args: self.args,
            disable_default_args: self.disable_default_args,
            process_envs: self.process_envs,
            user_data_dir: self.user_data_dir,
            debug_browser: self.debug_browser,
        })
    }
}

impl BrowserConfig {
    pub(crate) fn launch(&self, pair: &PipePair, user_data_dir: &Path) -> io::Result<Child> {
        let mut cmd = async_process::Command::new(&self.executable);

        if self.disable_default_args {
            cmd.args(&self.args);
        } else {
            cmd.args(DEFAULT_ARGS).args(&self.args);
        }

        if !self.args.iter().any(|arg| arg == "--remote-debugging-pipe") {
            cmd.arg("--remote-debugging-pipe");
        }
        cmd.arg(format!("--user-data-dir={}", user_data_dir.display()));

        if !self.sandbox {
            cmd.args(["--no-sandbox", "--disable-setuid-sandbox"]);
        }
        if self.headless {
            cmd.args(["--headless", "--hide-scrollbars", "--mute-audio"]);
        }

        // the environment contract the launcher shim reads
        cmd.env("BROWSER_PATH", &self.executable)
            .env("USER_DATA_DIR", user_data_dir);
        if self.headless {
            cmd.env("HEADLESS", "--headless");
        }
        if let Some(ref envs) = self.process_envs {
            cmd.envs(envs);
        }

        cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(
            if self.debug_browser {
                Stdio::inherit()
            } else {
                Stdio::null()
            },
        );

        #[cfg(unix)]
        {
            let (read_fd, write_fd) = pair.child_raw_fds();
            unsafe {
                cmd.pre_exec(move || crate::pipe::install_child_ends(read_fd, write_fd));
            }
            cmd.spawn()
        }
        #[cfg(windows)]
        {
            // Renumbering inherited handles onto fds 3 and 4 needs the CRT's
            // fd-passing block, which has no seam in std; launching on
            // windows goes through a wrapper executable instead.
            let _ = pair;
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "the pipe transport requires the posix fd-passing shim",
            ))
        }
    }
}

/// These are passed to the chrome binary by default.
/// Via https://github.com/puppeteer/puppeteer/blob/4846b8723cf20d3551c0d755df394cc5e0c82a94/src/node/Launcher.ts#L157
static DEFAULT_ARGS: [&str; 22] = [
    "--disable-background-networking",
    "--enable-features=NetworkService,NetworkServiceInProcess",
    "--disable-background-timer-throttling",
    "--disable-backgrounding-occluded-windows",
    "--disable-breakpad",
    "--disable-client-side-phishing-detection",
    "--disable-component-extensions-with-background-pages",
    "--disable-default-apps",
    "--disable-dev-shm-usage",
    "--disable-extensions",
    "--disable-features=TranslateUI",
    "--disable-hang-monitor",
    "--disable-ipc-flooding-protection",
    "--disable-popup-blocking",
    "--disable-prompt-on-repost",
    "--disable-renderer-backgrounding",
    "--disable-sync",
    "--force-color-profile=srgb",
    "--metrics-recording-only",
    "--no-first-run",
    "--password-store=basic",
    "--use-mock-keychain",
];
