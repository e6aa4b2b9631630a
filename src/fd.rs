//! Low-level SCM_RIGHTS fd-passing helpers and small async wrappers around
//! raw file descriptors that aren't `tokio`-native sockets.
//!
//! Grounded in the `sendmsg`/`recvmsg` usage patterns from
//! `examples/other_examples/2114b192_gravitational-teleport__tool-fdpass-teleport-src-main.rs.rs`
//! (send side) and
//! `examples/other_examples/98663b9a_novotnyllc-ContainAI__src-agent-task-runner-src-agent_task_runnerd.rs.rs`
//! (receive side).

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::sys::socket::{self, AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags, SockFlag, SockType, UnixAddr};
use std::io::{IoSlice, IoSliceMut};
use tokio::io::unix::AsyncFd;

/// Up to this many fds may ride along on a single received message, matching
/// the agent's read loop budget.
pub const MAX_FDS: usize = 10;

/// Size of the nonblocking read attempted per wakeup.
pub const RECV_CHUNK: usize = 4096;

/// A single nonblocking receive: the data bytes plus any fds passed along.
pub struct Received {
    pub data: Vec<u8>,
    pub fds: Vec<OwnedFd>,
}

/// Create a connected `AF_UNIX`/`SOCK_STREAM` pair, both ends blocking.
pub fn socketpair() -> io::Result<(OwnedFd, OwnedFd)> {
    socket::socketpair(AddressFamily::Unix, SockType::Stream, None, SockFlag::empty()).map_err(io::Error::from)
}

/// Set `O_NONBLOCK` on `fd`, needed before handing a raw fd to `tokio`.
pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    use nix::fcntl::{fcntl, FcntlArg, OFlag};
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL).map_err(io::Error::from)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK)).map_err(io::Error::from)?;
    Ok(())
}

/// One nonblocking `recvmsg` attempt. Returns `Err(WouldBlock)` if nothing
/// is currently available; callers should await readability and retry.
pub fn try_recv(fd: RawFd) -> io::Result<Received> {
    let mut buf = vec![0u8; RECV_CHUNK];
    let mut iov = [IoSliceMut::new(&mut buf)];
    let mut cmsg_space = nix::cmsg_space!([RawFd; MAX_FDS]);
    let msg = socket::recvmsg::<UnixAddr>(fd, &mut iov, Some(&mut cmsg_space), MsgFlags::empty())
        .map_err(io::Error::from)?;

    let mut fds = Vec::new();
    for cmsg in msg.cmsgs().map_err(io::Error::from)? {
        if let ControlMessageOwned::ScmRights(raw_fds) = cmsg {
            for raw in raw_fds {
                // SAFETY: the kernel duplicated these fds into our process
                // as part of the SCM_RIGHTS message; we now own them.
                fds.push(unsafe { OwnedFd::from_raw_fd(raw) });
            }
        }
    }
    let n = msg.bytes;
    drop(msg);
    buf.truncate(n);
    Ok(Received { data: buf, fds })
}

/// Send `data` with ancillary `fds` (in order) over `fd`.
pub fn send_with_fds(fd: RawFd, data: &[u8], fds: &[RawFd]) -> io::Result<()> {
    let iov = [IoSlice::new(data)];
    if fds.is_empty() {
        socket::sendmsg::<()>(fd, &iov, &[], MsgFlags::empty(), None).map_err(io::Error::from)?;
    } else {
        let cmsgs = [ControlMessage::ScmRights(fds)];
        socket::sendmsg::<()>(fd, &iov, &cmsgs, MsgFlags::empty(), None).map_err(io::Error::from)?;
    }
    Ok(())
}

/// Read the entirety of `fd` (a one-shot pipe or similar) to EOF.
///
/// Performed via `spawn_blocking` since the payload is small and this is a
/// one-shot operation, not something that needs to be cancellation-aware.
pub async fn read_to_end(fd: OwnedFd) -> io::Result<Vec<u8>> {
    tokio::task::spawn_blocking(move || {
        use std::io::Read;
        let mut file = std::fs::File::from(fd);
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        Ok(buf)
    })
    .await
    .expect("read_to_end blocking task panicked")
}

/// Write `data` to `fd` in full. Works for pipes, sockets, and ttys alike.
pub async fn write_all(fd: OwnedFd, data: Vec<u8>) -> io::Result<()> {
    tokio::task::spawn_blocking(move || {
        use std::io::Write;
        let mut file = std::fs::File::from(fd);
        file.write_all(&data)
    })
    .await
    .expect("write_all blocking task panicked")
}

/// A raw fd wrapper that does not close `fd` on drop, so it can be handed to
/// `AsyncFd` for a readiness wait while the real owner keeps the `OwnedFd`.
struct BorrowedRawFd(RawFd);

impl AsRawFd for BorrowedRawFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

/// Await `fd` becoming readable without consuming any data or taking
/// ownership, for a cancellation race (e.g. the askpass status fd closing
/// while a concurrent task still owns and writes to it).
pub async fn wait_readable(fd: RawFd) -> io::Result<()> {
    set_nonblocking(fd)?;
    let async_fd = AsyncFd::new(BorrowedRawFd(fd))?;
    async_fd.readable().await?.clear_ready();
    Ok(())
}
