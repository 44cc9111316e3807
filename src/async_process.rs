//! Internal module providing an async child process abstraction on top of
//! the tokio runtime.

use ::tokio::process;
use std::ffi::OsStr;
pub use std::process::{ExitStatus, Stdio};

#[derive(Debug)]
pub struct Command {
    inner: process::Command,
}

impl Command {
    pub fn new<S: AsRef<OsStr>>(program: S) -> Self {
        let mut inner = process::Command::new(program);
        // The kill and wait methods are async, so they cannot run in a Drop
        // implementation. The runtime reaps the child in the background if
        // the user never collected it.
        inner.kill_on_drop(true);
        Self { inner }
    }

    pub fn arg<S: AsRef<OsStr>>(&mut self, arg: S) -> &mut Self {
        self.inner.arg(arg);
        self
    }

    pub fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.inner.args(args);
        self
    }

    pub fn env<K, V>(&mut self, key: K, val: V) -> &mut Self
    where
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        self.inner.env(key, val);
        self
    }

    pub fn envs<I, K, V>(&mut self, vars: I) -> &mut Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        self.inner.envs(vars);
        self
    }

    pub fn stdin<T: Into<Stdio>>(&mut self, cfg: T) -> &mut Self {
        self.inner.stdin(cfg);
        self
    }

    pub fn stdout<T: Into<Stdio>>(&mut self, cfg: T) -> &mut Self {
        self.inner.stdout(cfg);
        self
    }

    pub fn stderr<T: Into<Stdio>>(&mut self, cfg: T) -> &mut Self {
        self.inner.stderr(cfg);
        self
    }

    /// Schedule a closure to run in the child between `fork` and `exec`;
    /// this is where the pipe ends get renumbered onto fds 3 and 4.
    ///
    /// # Safety
    ///
    /// The closure runs in the forked child and may only use
    /// async-signal-safe operations.
    #[cfg(unix)]
    pub unsafe fn pre_exec<F>(&mut self, f: F) -> &mut Self
    where
        F: FnMut() -> std::io::Result<()> + Send + Sync + 'static,
    {
        self.inner.pre_exec(f);
        self
    }

    /// Process creation flags; used to launch the child in its own process
    /// group so console signals do not propagate uncontrolled.
    #[cfg(windows)]
    pub fn creation_flags(&mut self, flags: u32) -> &mut Self {
        self.inner.creation_flags(flags);
        self
    }

    pub fn spawn(&mut self) -> std::io::Result<Child> {
        let inner = self.inner.spawn()?;
        Ok(Child { inner })
    }
}

/// Wrapper for an async child process.
#[derive(Debug)]
pub struct Child {
    pub inner: process::Child,
}

impl Child {
    /// The OS process id, while the child is still running.
    pub fn id(&self) -> Option<u32> {
        self.inner.id()
    }

    /// Kill the child process and asynchronously wait for it to exit.
    pub async fn kill(&mut self) -> std::io::Result<()> {
        self.inner.kill().await
    }

    /// Deliver the kill signal without waiting for the exit.
    pub fn start_kill(&mut self) -> std::io::Result<()> {
        self.inner.start_kill()
    }

    /// Asynchronously wait for the child process to exit.
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.inner.wait().await
    }

    /// If the child process has exited, get its status.
    pub fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>> {
        self.inner.try_wait()
    }
}
