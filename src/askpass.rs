//! The logic behind the `ferny-askpass` binary: relay `ssh`'s invocation
//! (as `$SSH_ASKPASS`, `LocalCommand`, or `KnownHostsCommand`) to whatever
//! process has the other end of its inherited stderr.
//!
//! Grounded in `examples/original_source/src/ferny/interaction_client.py`'s
//! `interact()`, adapted to the three-fd local-command contract
//! `interaction_agent.py`'s `InteractionAgent.communicate()` actually parses
//! (a payload pipe fd, followed by the command's own fds) rather than the
//! inline-payload/two-fd variant `interaction_client.py` sends — see
//! `DESIGN.md` for why the receiving side's contract was treated as
//! authoritative.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use crate::fd;
use crate::frame;
use crate::literal::Literal;

/// Default exit status reported when the agent closes the status channel
/// without writing anything (e.g. because it was cancelled).
const DEFAULT_STATUS: i32 = 1;

/// Send `sys.argv`/the environment to whatever is connected to `stderr_fd`,
/// then block for the reply. `stdout_fd` is handed over as-is so the agent
/// can write directly into it.
///
/// An empty `argv` (just the program's own path, no arguments) is treated as
/// the end-of-setup signal `ssh` triggers via a bare `LocalCommand=`: no
/// prompt is possible at that point, so `('ferny.end', ())` is sent instead
/// of `('ferny.askpass', ...)` and no fds are exchanged at all.
pub fn interact(stderr_fd: RawFd, stdout_fd: RawFd, argv: Vec<String>, env: HashMap<String, String>) -> std::io::Result<i32> {
    if argv.len() <= 1 {
        send_end(stderr_fd)?;
        return Ok(0);
    }
    send_askpass_command(stderr_fd, stdout_fd, argv, env)
}

fn send_end(stderr_fd: RawFd) -> std::io::Result<()> {
    let frame = frame::encode_remote("ferny.end", &[]);
    // SAFETY: stderr_fd is our inherited fd 2; we don't own it but a
    // borrowed write through it is safe for the lifetime of this call.
    let mut stream = unsafe { std::fs::File::from_raw_fd(stderr_fd) };
    let result = stream.write_all(&frame);
    std::mem::forget(stream); // don't close an fd we were only lent
    result
}

fn send_askpass_command(stderr_fd: RawFd, stdout_fd: RawFd, argv: Vec<String>, env: HashMap<String, String>) -> std::io::Result<i32> {
    let argv_literal = Literal::List(argv.into_iter().map(Literal::Str).collect());
    let env_literal = Literal::Map(env.into_iter().collect());
    let record = Literal::Tuple(vec![
        Literal::Str("ferny.askpass".to_owned()),
        Literal::Tuple(vec![argv_literal, env_literal]),
    ]);
    let payload = crate::literal::to_string(&record).into_bytes();

    let (payload_read, payload_write): (OwnedFd, OwnedFd) = nix::unistd::pipe().map_err(std::io::Error::from)?;
    {
        let mut writer = std::fs::File::from(payload_write);
        writer.write_all(&payload)?;
    }

    let (status_ours, status_theirs) = fd::socketpair()?;

    fd::send_with_fds(
        stderr_fd,
        &[0u8],
        &[payload_read.as_raw_fd(), status_theirs.as_raw_fd(), stdout_fd],
    )?;
    drop(payload_read);
    drop(status_theirs);

    let mut status_stream = UnixStream::from(status_ours);
    let mut buf = [0u8; 16];
    let n = status_stream.read(&mut buf).unwrap_or(0);
    if n == 0 {
        return Ok(DEFAULT_STATUS);
    }
    let text = String::from_utf8_lossy(&buf[..n]);
    Ok(text.trim().parse().unwrap_or(DEFAULT_STATUS))
}
