//! Command handlers: the generic [`InteractionHandler`] trait the agent
//! dispatches to, and the standard askpass implementation of it.
//!
//! Grounded in `examples/original_source/src/ferny/interaction_agent.py`'s
//! `InteractionResponder`/`_askpass_command`/`_askpass_task` and
//! `examples/original_source/src/ferny/ssh_askpass.py`'s `SshAskpassResponder`.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::os::fd::OwnedFd;
use std::pin::Pin;

use crate::fd;
use crate::literal::Literal;
use crate::prompt::{self, AskpassPrompt};

/// Boxed future alias used throughout the manually-written async trait
/// methods in this crate (no `async_trait`, matching the corpus's idiom for
/// dyn-compatible async traits).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Error returned by a handler while servicing a command.
#[derive(Debug)]
pub struct HandlerError(pub Box<dyn std::error::Error + Send + Sync>);

impl HandlerError {
    pub fn new<E: std::error::Error + Send + Sync + 'static>(e: E) -> Self {
        HandlerError(Box::new(e))
    }

    pub fn io(e: std::io::Error) -> Self {
        HandlerError(Box::new(e))
    }

    pub fn msg(s: impl Into<String>) -> Self {
        HandlerError(Box::<dyn std::error::Error + Send + Sync>::from(s.into()))
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for HandlerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.0.as_ref())
    }
}

/// A registrant for one or more command names flowing over the interaction
/// channel. The agent holds a `Vec<Box<dyn InteractionHandler>>` and
/// dispatches each incoming command to whichever handler claims its name.
pub trait InteractionHandler: Send + Sync {
    /// Command names this handler claims.
    fn commands(&self) -> Vec<&'static str>;

    /// Service one invocation. `fds` ownership is transferred to the
    /// handler; anything it doesn't consume is closed when this future (or
    /// the fds within it) drop.
    fn run_command<'a>(
        &'a self,
        command: &'a str,
        args: Vec<Literal>,
        fds: Vec<OwnedFd>,
        stderr: String,
    ) -> BoxFuture<'a, Result<(), HandlerError>>;
}

/// The prompt-level handler interface for `ferny.askpass`, matching the
/// upstream `AskpassHandler`/`InteractionResponder` split.
pub trait AskpassHandler: Send + Sync {
    fn commands(&self) -> Vec<&'static str> {
        vec!["ferny.askpass"]
    }

    /// Prompt the user for an authentication or confirmation interaction.
    /// `stderr` is whatever text accumulated before the interaction was
    /// requested; `prompt` is the interaction text; `hint` is
    /// `SSH_ASKPASS_PROMPT` (`"confirm"`, `"none"`, or empty).
    fn do_askpass<'a>(&'a self, _stderr: &'a str, _prompt: &'a str, _hint: &'a str) -> BoxFuture<'a, Option<String>> {
        Box::pin(async { None })
    }

    /// Decide whether to accept a host key offered via `KnownHostsCommand`.
    /// `reason` is `"HOSTNAME"` or `"ADDRESS"`.
    fn do_hostkey<'a>(
        &'a self,
        _reason: &'a str,
        _host: &'a str,
        _algorithm: &'a str,
        _key: &'a str,
        _fingerprint: &'a str,
    ) -> BoxFuture<'a, bool> {
        Box::pin(async { false })
    }

    /// Handle any command this handler claims other than `ferny.askpass`.
    fn do_custom_command<'a>(
        &'a self,
        _command: &'a str,
        _args: &'a [Literal],
        _fds: Vec<OwnedFd>,
        _stderr: &'a str,
    ) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(async { Ok(()) })
    }
}

/// Adapts an [`AskpassHandler`] into an [`InteractionHandler`], performing
/// the argv/env/fd validation and the status-fd cancellation race.
pub struct Askpass<H>(pub H);

impl<H: AskpassHandler> InteractionHandler for Askpass<H> {
    fn commands(&self) -> Vec<&'static str> {
        self.0.commands()
    }

    fn run_command<'a>(
        &'a self,
        command: &'a str,
        args: Vec<Literal>,
        fds: Vec<OwnedFd>,
        stderr: String,
    ) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(async move {
            if command == "ferny.askpass" {
                askpass_command(&self.0, args, fds, stderr).await
            } else {
                self.0.do_custom_command(command, &args, fds, &stderr).await
            }
        })
    }
}

fn parse_argv(list: &Literal) -> Option<Vec<String>> {
    list.as_list()?
        .iter()
        .map(|l| l.as_str().map(str::to_owned))
        .collect()
}

fn parse_env(map: &Literal) -> Option<HashMap<String, String>> {
    Some(map.as_map()?.iter().cloned().collect())
}

async fn askpass_command<H: AskpassHandler + ?Sized>(
    handler: &H,
    args: Vec<Literal>,
    mut fds: Vec<OwnedFd>,
    stderr: String,
) -> Result<(), HandlerError> {
    let (argv, env) = match args.as_slice() {
        [argv_lit, env_lit] => match (parse_argv(argv_lit), parse_env(env_lit)) {
            (Some(argv), Some(env)) => (argv, env),
            _ => {
                tracing::error!(?args, "invalid argument types for askpass interaction");
                return Ok(());
            }
        },
        _ => {
            tracing::error!(?args, "invalid argument shape for askpass interaction");
            return Ok(());
        }
    };

    if fds.len() != 2 {
        tracing::error!(count = fds.len(), "expected exactly two fds for askpass interaction");
        return Ok(());
    }
    let stdout_fd = fds.pop().unwrap();
    let status_fd = fds.pop().unwrap();

    use std::os::fd::AsRawFd;
    let status_raw = status_fd.as_raw_fd();
    fd::set_nonblocking(status_raw).map_err(HandlerError::io)?;

    tokio::select! {
        result = run_askpass_task(handler, argv, env, status_fd, stdout_fd, stderr) => result,
        _ = fd::wait_readable(status_raw) => Ok(()),
    }
}

async fn run_askpass_task<H: AskpassHandler + ?Sized>(
    handler: &H,
    argv: Vec<String>,
    env: HashMap<String, String>,
    status_fd: OwnedFd,
    stdout_fd: OwnedFd,
    stderr: String,
) -> Result<(), HandlerError> {
    match argv.len() {
        2 => {
            let hint = env.get("SSH_ASKPASS_PROMPT").cloned().unwrap_or_default();
            if let Some(answer) = handler.do_askpass(&stderr, &argv[1], &hint).await {
                fd::write_all(stdout_fd, format!("{answer}\n").into_bytes())
                    .await
                    .map_err(HandlerError::io)?;
                fd::write_all(status_fd, b"0\n".to_vec()).await.map_err(HandlerError::io)?;
            }
        }
        6 => {
            let reason = argv[1].as_str();
            let (host, algorithm, key, fingerprint) = (&argv[2], &argv[3], &argv[4], &argv[5]);
            if reason == "ADDRESS" || reason == "HOSTNAME" {
                if handler.do_hostkey(reason, host, algorithm, key, fingerprint).await {
                    let line = format!("{host} {algorithm} {key}\n");
                    fd::write_all(stdout_fd, line.into_bytes()).await.map_err(HandlerError::io)?;
                }
            }
            fd::write_all(status_fd, b"0\n".to_vec()).await.map_err(HandlerError::io)?;
        }
        n => {
            tracing::error!(argc = n, ?argv, "incorrect number of command-line arguments to ferny-askpass");
        }
    }
    Ok(())
}

/// One `do_*_prompt` method per [`AskpassPrompt`] variant, dispatched from a
/// classified `ssh` prompt. Mirrors `SshAskpassResponder`.
pub trait PromptResponder: Send + Sync {
    fn do_prompt<'a>(&'a self, _prompt: &'a AskpassPrompt) -> BoxFuture<'a, Option<String>> {
        Box::pin(async { None })
    }

    fn do_password_prompt<'a>(&'a self, prompt: &'a AskpassPrompt) -> BoxFuture<'a, Option<String>> {
        self.do_prompt(prompt)
    }

    fn do_passphrase_prompt<'a>(&'a self, prompt: &'a AskpassPrompt) -> BoxFuture<'a, Option<String>> {
        self.do_prompt(prompt)
    }

    fn do_fido_pin_prompt<'a>(&'a self, prompt: &'a AskpassPrompt) -> BoxFuture<'a, Option<String>> {
        self.do_prompt(prompt)
    }

    fn do_fido_user_presence_prompt<'a>(&'a self, prompt: &'a AskpassPrompt) -> BoxFuture<'a, Option<String>> {
        self.do_prompt(prompt)
    }

    fn do_pkcs11_pin_prompt<'a>(&'a self, prompt: &'a AskpassPrompt) -> BoxFuture<'a, Option<String>> {
        self.do_prompt(prompt)
    }

    fn do_host_key_prompt<'a>(&'a self, prompt: &'a AskpassPrompt) -> BoxFuture<'a, Option<String>> {
        self.do_prompt(prompt)
    }
}

/// Adapts a [`PromptResponder`] into an [`AskpassHandler`] by classifying
/// the raw prompt text before dispatching.
pub struct SshAskpass<R>(pub R);

impl<R: PromptResponder> AskpassHandler for SshAskpass<R> {
    fn do_askpass<'a>(&'a self, stderr: &'a str, prompt_text: &'a str, _hint: &'a str) -> BoxFuture<'a, Option<String>> {
        Box::pin(async move {
            let prompt = prompt::categorize_ssh_prompt(prompt_text, stderr);
            dispatch_prompt(&self.0, &prompt).await
        })
    }
}

async fn dispatch_prompt<R: PromptResponder + ?Sized>(r: &R, prompt: &AskpassPrompt) -> Option<String> {
    match prompt {
        AskpassPrompt::Password { .. } => r.do_password_prompt(prompt).await,
        AskpassPrompt::Passphrase { .. } => r.do_passphrase_prompt(prompt).await,
        AskpassPrompt::FidoPin { .. } => r.do_fido_pin_prompt(prompt).await,
        AskpassPrompt::FidoUserPresence { .. } => r.do_fido_user_presence_prompt(prompt).await,
        AskpassPrompt::Pkcs11Pin { .. } => r.do_pkcs11_pin_prompt(prompt).await,
        AskpassPrompt::HostKey { .. } => r.do_host_key_prompt(prompt).await,
        AskpassPrompt::Generic { .. } => r.do_prompt(prompt).await,
    }
}
