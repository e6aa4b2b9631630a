//! A spawned subprocess whose stderr is entirely consumed by an
//! [`InteractionAgent`], exposing stdin/stdout like a plain transport.
//!
//! Grounded in `examples/original_source/src/ferny/transport.py`'s
//! `FernyTransport`, collapsed from its `asyncio.Transport`/
//! `asyncio.SubprocessProtocol` double role into a single struct: tokio's
//! `Child` already gives us the stdin/stdout pipes and exit-status future
//! that `FernyTransport` has to synthesize by hand from the asyncio
//! callback-based subprocess API.

use std::io;
use std::process::Stdio;

use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::agent::InteractionAgent;
use crate::error::Error;
use crate::handler::InteractionHandler;

/// A running subprocess plus the interaction agent mediating its stderr.
///
/// `child` is `None` when `command.spawn()` itself failed (e.g. the binary
/// doesn't exist): spec.md's "the spawn call never throws" contract means
/// that failure is stashed in `spawn_error` and only surfaces the first time
/// the caller awaits [`FernyTransport::wait_connected`] or
/// [`FernyTransport::wait`], the same single terminal path every other
/// disconnect reason goes through.
pub struct FernyTransport {
    child: Option<Child>,
    agent: InteractionAgent,
    is_ssh: bool,
    closed: bool,
    spawn_error: Option<io::Error>,
}

impl FernyTransport {
    /// Spawn `command` with its stdin/stdout available to the caller and its
    /// stderr routed through a fresh [`InteractionAgent`] built from
    /// `handlers`. `is_ssh` controls whether a `255` exit status gets
    /// reinterpreted via [`crate::error::classify_stderr`].
    pub fn spawn(mut command: Command, handlers: Vec<Box<dyn InteractionHandler>>, is_ssh: bool) -> Result<Self, Error> {
        let mut agent = InteractionAgent::new(handlers).map_err(Error::Io)?;
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(agent.theirs_stdio());
        match command.spawn() {
            Ok(child) => Ok(Self { child: Some(child), agent, is_ssh, closed: false, spawn_error: None }),
            Err(e) => Ok(Self { child: None, agent, is_ssh, closed: false, spawn_error: Some(e) }),
        }
    }

    /// Run the interaction agent until the end-of-setup sentinel, or fail
    /// with whatever the process reported in the meantime. Intended to be
    /// awaited once, right after [`FernyTransport::spawn`], before handing
    /// the transport over for regular use.
    pub async fn wait_connected(&mut self) -> Result<(), Error> {
        if let Some(e) = self.spawn_error.take() {
            return Err(Error::Io(e));
        }
        self.agent.communicate().await?;
        Ok(())
    }

    pub fn stdin(&mut self) -> &mut ChildStdin {
        self.child.as_mut().expect("subprocess never started").stdin.as_mut().expect("stdin not piped")
    }

    pub fn stdout(&mut self) -> &mut ChildStdout {
        self.child.as_mut().expect("subprocess never started").stdout.as_mut().expect("stdout not piped")
    }

    pub fn id(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// Half-close the child's stdin, signaling EOF without touching
    /// anything else: drops the write end entirely, since that's the only
    /// way to send EOF through a pipe (there's no partial-shutdown ioctl).
    pub fn write_eof(&mut self) {
        if let Some(child) = self.child.as_mut() {
            child.stdin.take();
        }
    }

    /// Kill the subprocess immediately. Any resulting nonzero exit status is
    /// treated as clean, since we're the ones who asked for it.
    pub async fn close(&mut self) -> Result<(), Error> {
        self.closed = true;
        if let Some(child) = self.child.as_mut() {
            let _ = child.start_kill();
        }
        self.wait().await
    }

    /// Drive the child process and its interaction agent to completion,
    /// resolving with the single best-effort diagnosis of how the
    /// connection ended.
    ///
    /// Mirrors `FernyTransport._consider_disconnect`'s priority order: an
    /// explicit failure from either side outranks a clean exit, which
    /// outranks an ssh-specific interpretation of exit code 255, which
    /// outranks a generic subprocess failure. A spawn failure outranks all
    /// of that, since there was never a process to race against.
    pub async fn wait(&mut self) -> Result<(), Error> {
        if let Some(e) = self.spawn_error.take() {
            return Err(Error::Io(e));
        }

        let agent = &mut self.agent;
        let child = self.child.as_mut().expect("spawn_error already handled above");

        let (status, stderr) = tokio::select! {
            biased;
            status = child.wait() => {
                let stderr = agent.force_completion();
                (status.map_err(Error::Io), Ok(stderr))
            }
            stderr = agent.run() => {
                let status = child.wait().await;
                (status.map_err(Error::Io), stderr)
            }
        };

        self.consider_disconnect(status, stderr)
    }

    fn consider_disconnect(&self, status: Result<std::process::ExitStatus, Error>, stderr: Result<String, Error>) -> Result<(), Error> {
        let status = status?;
        let stderr = stderr?;

        let returncode = status.code().unwrap_or(-1);
        if self.closed || returncode == 0 {
            Ok(())
        } else if self.is_ssh && returncode == 255 {
            Err(crate::error::classify_stderr(&stderr))
        } else {
            Err(Error::Subprocess { returncode, stderr })
        }
    }
}
