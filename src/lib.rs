//! Drive an unmodified `ssh(1)` as a child process and mediate every
//! interactive prompt it would otherwise print to a terminal (**only works
//! on unix**).
//!
//! `ssh` insists on talking to a real terminal (or, failing that, an
//! askpass helper) for passwords, key passphrases, FIDO touch requests, and
//! host key confirmations. This crate supplies that askpass helper itself
//! ([`ferny-askpass`](askpass)), relays its invocations back to your async
//! event loop over a private side channel, and lets you answer them however
//! you like: prompt a real user, look a secret up in a vault, or refuse.
//!
//! # The pieces
//!
//! - [`literal`] — the restricted literal grammar (strings, integers,
//!   booleans, `None`, lists, tuples, string-keyed maps) every command on
//!   the wire is encoded with.
//! - [`frame`] — byte framing for commands embedded directly in `ssh`'s
//!   stderr stream.
//! - [`fd`] — `SCM_RIGHTS` fd-passing primitives for commands that need to
//!   hand over file descriptors (askpass does, to deliver its reply).
//! - [`prompt`] — classification of `ssh`'s askpass prompt text into a
//!   structured [`prompt::AskpassPrompt`].
//! - [`handler`] — the [`handler::InteractionHandler`] trait the agent
//!   dispatches commands to, and the standard askpass/prompt-responder
//!   adapters built on top of it.
//! - [`agent`] — [`agent::InteractionAgent`], the parent-side endpoint that
//!   owns the side channel and drives dispatch.
//! - [`askpass`] — the logic behind the `ferny-askpass` binary itself.
//! - [`error`] — the error types returned across this crate, including
//!   classification of `ssh`'s stderr into a structured [`error::SshError`].
//! - [`transport`] — [`transport::FernyTransport`], a spawned subprocess
//!   whose stderr is entirely consumed by an interaction agent.
//! - [`session`] — [`session::Session`], a control-master `ssh` connection
//!   built on top of a transport, for running further multiplexed commands.
//!
//! # Example
//!
//! ```rust,no_run
//! # #[tokio::main]
//! # async fn main() -> Result<(), ferny::Error> {
//! use ferny::session::{ConnectOptions, Session};
//!
//! let mut session = Session::connect("me@example.com", ConnectOptions::default(), None).await?;
//! session.command("whoami", &[]).status().await?;
//! session.disconnect().await?;
//! # Ok(()) }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

#[cfg(not(unix))]
compile_error!("This crate can only be used on unix");

pub mod literal;

pub mod frame;

pub mod fd;

pub mod prompt;

pub mod handler;
pub use handler::{AskpassHandler, InteractionHandler, PromptResponder};

pub mod agent;
pub use agent::InteractionAgent;

pub mod askpass;

pub mod error;
pub use error::{Error, SshError};

pub mod transport;
pub use transport::FernyTransport;

pub mod session;
pub use session::Session;
