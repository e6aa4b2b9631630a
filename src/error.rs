use std::fmt;
use std::io;

/// Errors that occur while driving `ssh(1)` and mediating its prompts.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// `ssh` exited with a message this crate could classify.
    Ssh(SshError),

    /// An OS-level error (connection refused, DNS failure, ...) recovered by
    /// matching the tail of `ssh`'s stderr against `strerror`/`gai_strerror`.
    Os(io::Error),

    /// The child exited nonzero and none of the more specific classifiers
    /// matched; `stderr` is whatever it printed.
    Subprocess { returncode: i32, stderr: String },

    /// The interaction agent's socket closed, or produced garbage, before
    /// the conversation with `ssh` was able to complete.
    Interaction(String),

    /// A user-supplied [`InteractionHandler`](crate::handler::InteractionHandler)
    /// returned an error while servicing a command.
    Handler(Box<dyn std::error::Error + Send + Sync>),

    /// I/O failure in the agent/transport plumbing itself (socket read,
    /// fd-passing), as opposed to a parsed `ssh` stderr tail.
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Ssh(e) => write!(f, "{e}"),
            Error::Os(e) => write!(f, "{e}"),
            Error::Subprocess { returncode, stderr } => {
                write!(f, "ssh exited with status {returncode}: {stderr}")
            }
            Error::Interaction(msg) => write!(f, "interaction channel error: {msg}"),
            Error::Handler(e) => write!(f, "interaction handler failed: {e}"),
            Error::Io(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Ssh(e) => Some(e),
            Error::Os(e) | Error::Io(e) => Some(e),
            Error::Handler(e) => Some(e.as_ref()),
            Error::Subprocess { .. } | Error::Interaction(_) => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

/// The classified subset of `ssh(1)` failures spec.md's Error entity names.
#[derive(Debug)]
#[non_exhaustive]
pub enum SshError {
    /// `destination: Permission denied (method,method,...).`
    Authentication { destination: String, methods: Vec<String> },

    /// Host key verification failed because no host key was known at all.
    UnknownHostKey { stderr: String },

    /// Host key verification failed because the known host key changed.
    ChangedHostKey { stderr: String },

    /// Host key verification failed for some other/unrecognized reason.
    HostKey { stderr: String },

    /// `ssh` rejected the destination hostname outright (`Bad hostname`).
    InvalidHostname { stderr: String },

    /// `ssh` failed in a way none of the above patterns recognize.
    Generic { stderr: String },
}

impl fmt::Display for SshError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SshError::Authentication { destination, methods } => write!(
                f,
                "{destination}: permission denied ({})",
                methods.join(",")
            ),
            SshError::UnknownHostKey { .. } => write!(f, "host key verification failed: unknown host key"),
            SshError::ChangedHostKey { .. } => write!(f, "host key verification failed: host key changed"),
            SshError::HostKey { .. } => write!(f, "host key verification failed"),
            SshError::InvalidHostname { stderr } => write!(f, "invalid hostname: {stderr}"),
            SshError::Generic { stderr } => write!(f, "{stderr}"),
        }
    }
}

impl std::error::Error for SshError {}

static AUTHENTICATION_RE: once_cell::sync::Lazy<regex::Regex> = once_cell::sync::Lazy::new(|| {
    regex::Regex::new(r"(?m)^([^:]+): Permission denied \(([^()]+)\)\.$").unwrap()
});

static HOST_KEY_RE: once_cell::sync::Lazy<regex::Regex> =
    once_cell::sync::Lazy::new(|| regex::Regex::new(r"(?m)^Host key verification failed\.$").unwrap());

static INVALID_HOSTNAME_RE: once_cell::sync::Lazy<regex::Regex> =
    once_cell::sync::Lazy::new(|| regex::Regex::new(r"(?m)^Bad hostname").unwrap());

/// The getaddrinfo-family error strings this crate knows how to recognize,
/// paired with the libc `EAI_*` constant they correspond to.
const GAI_CODES: &[i32] = &[
    libc::EAI_NONAME,
    libc::EAI_AGAIN,
    libc::EAI_FAIL,
    libc::EAI_SERVICE,
    libc::EAI_SOCKTYPE,
    libc::EAI_FAMILY,
    libc::EAI_MEMORY,
];

/// `errno` values this crate maps back to an [`io::ErrorKind`] when they
/// appear as the tail of an `ssh` stderr line.
const ERRNO_CODES: &[i32] = &[
    libc::ECONNREFUSED,
    libc::ETIMEDOUT,
    libc::ENOENT,
    libc::EACCES,
    libc::EPERM,
    libc::EPIPE,
    libc::EHOSTUNREACH,
    libc::ECONNRESET,
    libc::ECONNABORTED,
    libc::ENETUNREACH,
];

fn gai_strerror(code: i32) -> String {
    // SAFETY: gai_strerror returns a pointer to a static string table.
    unsafe {
        let ptr = libc::gai_strerror(code);
        std::ffi::CStr::from_ptr(ptr).to_string_lossy().into_owned()
    }
}

fn strerror(errno: i32) -> String {
    // SAFETY: strerror returns a pointer to a thread-local/static buffer
    // that's immediately copied out; we never hold onto it across calls.
    unsafe {
        let ptr = libc::strerror(errno);
        std::ffi::CStr::from_ptr(ptr).to_string_lossy().into_owned()
    }
}

/// Classify the stderr `ssh(1)` printed into the most specific [`Error`] we
/// can recognize, following the upstream classifier's "generic catch-all if
/// nothing matches" philosophy.
pub fn classify_stderr(stderr: &str) -> Error {
    if let Some(caps) = AUTHENTICATION_RE.captures(stderr) {
        let destination = caps[1].to_string();
        let methods = caps[2].split(',').map(str::to_owned).collect();
        return Error::Ssh(SshError::Authentication { destination, methods });
    }

    if HOST_KEY_RE.is_match(stderr) {
        if stderr.contains("No ") && stderr.contains("host key is known for") {
            return Error::Ssh(SshError::UnknownHostKey { stderr: stderr.to_owned() });
        }
        if stderr.contains("WARNING: REMOTE HOST IDENTIFICATION HAS CHANGED") {
            return Error::Ssh(SshError::ChangedHostKey { stderr: stderr.to_owned() });
        }
        return Error::Ssh(SshError::HostKey { stderr: stderr.to_owned() });
    }

    if INVALID_HOSTNAME_RE.is_match(stderr) {
        return Error::Ssh(SshError::InvalidHostname { stderr: stderr.to_owned() });
    }

    if let Some((_, after)) = stderr.trim().rsplit_once(':') {
        let tail = after.trim();
        if !tail.is_empty() {
            for &code in GAI_CODES {
                if gai_strerror(code) == tail {
                    return Error::Os(io::Error::new(io::ErrorKind::Other, stderr.to_owned()));
                }
            }
            for &errno in ERRNO_CODES {
                if strerror(errno) == tail {
                    return Error::Os(io::Error::from_raw_os_error(errno));
                }
            }
        }
    }

    Error::Ssh(SshError::Generic { stderr: stderr.to_owned() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_authentication_failure() {
        let stderr = "user@host: Permission denied (publickey,password).";
        match classify_stderr(stderr) {
            Error::Ssh(SshError::Authentication { destination, methods }) => {
                assert_eq!(destination, "user@host");
                assert_eq!(methods, vec!["publickey", "password"]);
            }
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn classifies_host_key_variants() {
        let unknown = "Host key verification failed.\nNo ED25519 host key is known for host and you have requested strict checking.";
        assert!(matches!(
            classify_stderr(unknown),
            Error::Ssh(SshError::UnknownHostKey { .. })
        ));

        let changed = "@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@\nWARNING: REMOTE HOST IDENTIFICATION HAS CHANGED!\nHost key verification failed.";
        assert!(matches!(
            classify_stderr(changed),
            Error::Ssh(SshError::ChangedHostKey { .. })
        ));

        let generic = "Host key verification failed.";
        assert!(matches!(classify_stderr(generic), Error::Ssh(SshError::HostKey { .. })));
    }

    #[test]
    fn classifies_connection_refused() {
        let stderr = "ssh: connect to host example.com port 22: Connection refused";
        assert!(matches!(classify_stderr(stderr), Error::Os(_)));
    }

    #[test]
    fn falls_back_to_generic() {
        let stderr = "ssh: some completely novel failure mode";
        assert!(matches!(classify_stderr(stderr), Error::Ssh(SshError::Generic { .. })));
    }
}
