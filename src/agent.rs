//! The parent-side endpoint of the interaction channel.
//!
//! Grounded in `examples/original_source/src/ferny/interaction_agent.py`'s
//! `InteractionAgent.communicate()`/`invoke_command()`.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;

use tokio::task::JoinSet;

use crate::error::Error;
use crate::fd;
use crate::frame;
use crate::handler::{HandlerError, InteractionHandler};
use crate::literal::Literal;

/// Number of nonblocking `recvmsg` attempts [`InteractionAgent::force_completion`]
/// makes before giving up; bounds the "use up the kernel's pending socket
/// buffer, don't block" drain.
const MAX_DRAIN_ATTEMPTS: usize = 64;

/// Owns the parent-side half of the interaction socketpair, parses the
/// interleaving of plain stderr bytes and framed/fd-carrying commands, and
/// dispatches them to registered [`InteractionHandler`]s.
pub struct InteractionAgent {
    ours_raw: Option<OwnedFd>,
    ours: Option<tokio::net::UnixStream>,
    theirs: Option<OwnedFd>,
    handlers: Vec<Arc<dyn InteractionHandler>>,
    commands: HashMap<&'static str, usize>,
    buffer: Vec<u8>,
    end_seen: bool,
    tasks: JoinSet<Result<(), HandlerError>>,
}

impl InteractionAgent {
    /// Create a new agent and its socketpair. `handlers` are consulted in
    /// order; later registrations for the same command name win.
    pub fn new(handlers: Vec<Box<dyn InteractionHandler>>) -> io::Result<Self> {
        let (ours, theirs) = fd::socketpair()?;
        let handlers: Vec<Arc<dyn InteractionHandler>> = handlers.into_iter().map(Arc::from).collect();

        let mut commands = HashMap::new();
        for (idx, handler) in handlers.iter().enumerate() {
            for name in handler.commands() {
                commands.insert(name, idx);
            }
        }

        Ok(Self {
            ours_raw: Some(ours),
            ours: None,
            theirs: Some(theirs),
            handlers,
            commands,
            buffer: Vec::new(),
            end_seen: false,
            tasks: JoinSet::new(),
        })
    }

    /// Hand off the child-side socket half as a `Stdio`, consuming it. Call
    /// this exactly once, right before spawning the child whose stderr this
    /// agent will mediate.
    pub fn theirs_stdio(&mut self) -> std::process::Stdio {
        let fd = self.theirs.take().expect("InteractionAgent::theirs_stdio called twice");
        std::process::Stdio::from(fd)
    }

    /// Whether the `('ferny.end', ())` sentinel has been observed.
    pub fn end_seen(&self) -> bool {
        self.end_seen
    }

    fn start(&mut self) -> io::Result<()> {
        if self.ours.is_none() {
            let raw = self.ours_raw.take().expect("InteractionAgent::start called twice");
            fd::set_nonblocking(raw.as_raw_fd())?;
            let std_stream = std::os::unix::net::UnixStream::from(raw);
            std_stream.set_nonblocking(true)?;
            self.ours = Some(tokio::net::UnixStream::from_std(std_stream)?);
        }
        Ok(())
    }

    /// Run until the end-of-setup sentinel arrives, then return
    /// immediately with whatever stderr has accumulated so far (the
    /// channel is left open for further use, matching the upstream
    /// "a subprocess may keep using the channel after connection"
    /// behavior).
    ///
    /// If the channel closes (EOF) before the sentinel arrives, that's a
    /// failed connection attempt, not a clean finish: returns
    /// `Error::Interaction` with whatever stderr was collected, mirroring
    /// `InteractionAgent.communicate()` raising `InteractionError` in the
    /// same situation.
    pub async fn communicate(&mut self) -> Result<String, Error> {
        self.start().map_err(Error::Io)?;
        loop {
            if self.end_seen {
                return Ok(String::from_utf8_lossy(&self.buffer).into_owned());
            }
            if let Some(stderr) = self.step().await? {
                return Err(Error::Interaction(stderr));
            }
        }
    }

    /// Run for the full lifetime of the channel: until EOF, a read error,
    /// or [`InteractionAgent::force_completion`] is called. Used by the
    /// transport, which needs the channel to stay alive after setup.
    pub async fn run(&mut self) -> Result<String, Error> {
        self.start().map_err(Error::Io)?;
        loop {
            if let Some(result) = self.step().await? {
                return Ok(result);
            }
        }
    }

    /// Run one iteration: either reap a finished handler task, or attempt a
    /// read. Returns `Some(stderr)` once the channel has reached EOF.
    ///
    /// `tokio::select!` has to hold both branch futures alive for as long as
    /// neither has resolved, so a branch built from a `&mut self` method
    /// (like the old `self.read_once()`) can never run alongside
    /// `self.tasks.join_next()`'s borrow of `self.tasks` — the two
    /// mutable borrows of `self` overlap even though only one branch ever
    /// actually wins. Splitting the race into a standalone `Event` first,
    /// built from nothing but the two disjoint fields each branch actually
    /// needs, and only touching `&mut self` afterwards (once the `select!`
    /// block itself has ended and released both borrows) sidesteps that.
    async fn step(&mut self) -> Result<Option<String>, Error> {
        enum Event {
            TaskDone(Result<Result<(), HandlerError>, tokio::task::JoinError>),
            Received(Result<fd::Received, Error>),
        }

        let event = {
            let ours = self.ours.as_ref().expect("agent not started");
            tokio::select! {
                biased;
                Some(res) = self.tasks.join_next(), if !self.tasks.is_empty() => Event::TaskDone(res),
                received = Self::read_once(ours) => Event::Received(received),
            }
        };

        match event {
            Event::TaskDone(res) => {
                self.handle_task_result(res)?;
                Ok(None)
            }
            Event::Received(received) => self.handle_received(received?).await,
        }
    }

    fn handle_task_result(&mut self, res: Result<Result<(), HandlerError>, tokio::task::JoinError>) -> Result<(), Error> {
        match res {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::Handler(e.0)),
            Err(je) if je.is_cancelled() => Ok(()),
            Err(je) => Err(Error::Interaction(format!("handler task panicked: {je}"))),
        }
    }

    /// Wait for and decode one datagram off `sock`, retrying on a spurious
    /// wakeup. Takes the socket directly rather than `&self` so it can race
    /// against `self.tasks.join_next()` in [`InteractionAgent::step`]
    /// without both borrowing all of `self`.
    async fn read_once(sock: &tokio::net::UnixStream) -> Result<fd::Received, Error> {
        let raw_fd = sock.as_raw_fd();
        loop {
            sock.readable().await.map_err(Error::Io)?;

            match sock.try_io(tokio::io::Interest::READABLE, || fd::try_recv(raw_fd)) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(Error::Io(e)),
                Ok(received) => return Ok(received),
            }
        }
    }

    async fn handle_received(&mut self, received: fd::Received) -> Result<Option<String>, Error> {
        if received.data.is_empty() && received.fds.is_empty() {
            return Ok(Some(String::from_utf8_lossy(&self.buffer).trim().to_owned()));
        }

        self.buffer.extend_from_slice(&received.data);

        let (pairs, tail) = frame::split_frames(&self.buffer);
        self.buffer = tail;
        for (prefix, payload) in pairs {
            self.invoke_command(prefix, &payload, Vec::new()).await;
        }

        if !received.fds.is_empty() {
            if self.buffer.last() != Some(&0u8) {
                tracing::warn!(buffer = ?self.buffer, "local command buffer did not end in NUL, dropping");
                return Ok(None);
            }
            let stderr_ctx = self.buffer[..self.buffer.len() - 1].to_vec();
            self.buffer.clear();

            let mut fds = received.fds;
            let payload_fd = fds.remove(0);
            let payload = fd::read_to_end(payload_fd).await.map_err(Error::Io)?;
            self.invoke_command(stderr_ctx, &payload, fds).await;
        }

        Ok(None)
    }

    async fn invoke_command(&mut self, stderr: Vec<u8>, payload: &[u8], fds: Vec<OwnedFd>) {
        let text = match std::str::from_utf8(payload) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(%e, "received non-utf8 ferny command");
                return;
            }
        };

        let (command, args) = match crate::literal::parse(text) {
            Ok(Literal::Tuple(items)) if items.len() == 2 => match (&items[0], &items[1]) {
                (Literal::Str(cmd), Literal::Tuple(args)) => (cmd.clone(), args.clone()),
                _ => {
                    tracing::warn!(payload = text, "invalid ferny command argument types");
                    return;
                }
            },
            Ok(_) => {
                tracing::warn!(payload = text, "invalid ferny command shape");
                return;
            }
            Err(e) => {
                tracing::warn!(payload = text, %e, "failed to parse ferny command");
                return;
            }
        };

        if command == "ferny.end" {
            self.end_seen = true;
            return;
        }

        let stderr_text = String::from_utf8_lossy(&stderr).into_owned();

        match self.commands.get(command.as_str()) {
            Some(&idx) => {
                let handler = Arc::clone(&self.handlers[idx]);
                self.tasks.spawn(async move { handler.run_command(&command, args, fds, stderr_text).await });
            }
            None => {
                tracing::warn!(%command, fds = fds.len(), "unknown ferny command, dropping");
            }
        }
    }

    /// Drain any data already queued on the socket without blocking, then
    /// resolve with whatever stderr accumulated. Used once the caller
    /// already knows there's nothing more worth waiting for (e.g. the
    /// subprocess has already exited).
    pub fn force_completion(&mut self) -> String {
        if let Some(sock) = &self.ours {
            let raw_fd = sock.as_raw_fd();
            for _ in 0..MAX_DRAIN_ATTEMPTS {
                match fd::try_recv(raw_fd) {
                    Ok(received) if received.data.is_empty() && received.fds.is_empty() => break,
                    Ok(received) => {
                        self.buffer.extend_from_slice(&received.data);
                        // Local commands during a forced drain have no
                        // chance to run to completion; their fds are
                        // simply closed.
                        drop(received.fds);
                    }
                    Err(_) => break,
                }
            }
        }
        self.tasks.abort_all();
        String::from_utf8_lossy(&self.buffer).trim().to_owned()
    }
}
