//! End-to-end scenarios against [`ferny::transport::FernyTransport`] driving
//! real child processes (`true`, `false`, `cat`, `sh`) rather than `ssh(1)`
//! itself, matching how `examples/original_source/test/test_transport.py`
//! exercises `FernyTransport` against stand-in subprocesses.

use std::io::ErrorKind;
use std::sync::Once;

use assert_matches::assert_matches;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

use ferny::transport::FernyTransport;
use ferny::{Error, SshError};

static INIT_TRACING: Once = Once::new();

/// Route `tracing::warn!`/etc emitted by the agent (malformed commands,
/// dropped fds, ...) to stderr so a failing test actually shows them,
/// instead of silently discarding every event.
fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt::try_init();
    });
}

/// spec.md §8 scenario 1 / §4.5: the spawn call itself never fails; an exec
/// error arrives through the same terminal path as every other disconnect
/// reason, the first time the caller awaits the transport.
#[tokio::test]
async fn spawning_a_missing_binary_fails_through_wait_connected() {
    init_tracing();
    let command = Command::new("/nonexistent/ferny-test-binary");
    let mut transport = FernyTransport::spawn(command, vec![], false).unwrap();
    match transport.wait_connected().await {
        Err(Error::Io(e)) => assert_eq!(e.kind(), ErrorKind::NotFound),
        other => panic!("expected a NotFound error from wait_connected, got {other:?}"),
    }
}

/// The same spawn failure, observed via `wait()` instead of
/// `wait_connected()` — both terminal-path entry points see it.
#[tokio::test]
async fn spawning_a_missing_binary_fails_through_wait() {
    init_tracing();
    let command = Command::new("/nonexistent/ferny-test-binary");
    let mut transport = FernyTransport::spawn(command, vec![], false).unwrap();
    match transport.wait().await {
        Err(Error::Io(e)) => assert_eq!(e.kind(), ErrorKind::NotFound),
        other => panic!("expected a NotFound error from wait, got {other:?}"),
    }
}

#[tokio::test]
async fn true_exits_cleanly() {
    init_tracing();
    let command = Command::new("true");
    let mut transport = FernyTransport::spawn(command, vec![], false).unwrap();
    assert_matches!(transport.wait().await, Ok(()));
}

#[tokio::test]
async fn false_reports_a_subprocess_error() {
    init_tracing();
    let command = Command::new("false");
    let mut transport = FernyTransport::spawn(command, vec![], false).unwrap();
    match transport.wait().await {
        Err(Error::Subprocess { returncode, stderr }) => {
            assert_eq!(returncode, 1);
            assert_eq!(stderr, "");
        }
        other => panic!("expected Error::Subprocess, got {other:?}"),
    }
}

#[tokio::test]
async fn cat_echoes_stdin_until_eof() {
    init_tracing();
    let command = Command::new("cat");
    let mut transport = FernyTransport::spawn(command, vec![], false).unwrap();

    transport.stdin().write_all(b"hihi").await.unwrap();
    transport.write_eof();

    let mut out = Vec::new();
    transport.stdout().read_to_end(&mut out).await.unwrap();
    assert_eq!(out, b"hihi");

    assert_matches!(transport.wait().await, Ok(()));
}

#[tokio::test]
async fn closing_kills_the_child_immediately() {
    init_tracing();
    let mut command = Command::new("sleep");
    command.arg("60");
    let mut transport = FernyTransport::spawn(command, vec![], false).unwrap();
    assert_matches!(transport.close().await, Ok(()));
}

/// `ssh` exiting 255 with a classifiable stderr tail is reinterpreted via
/// [`ferny::error::classify_stderr`], not reported as a raw subprocess error.
#[tokio::test]
async fn ssh_255_exit_is_classified_as_changed_host_key() {
    init_tracing();
    let mut command = Command::new("sh");
    command.arg("-c").arg(concat!(
        "printf '%s\\n' '@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@' >&2; ",
        "printf '%s\\n' 'WARNING: REMOTE HOST IDENTIFICATION HAS CHANGED!' >&2; ",
        "printf '%s\\n' 'Host key verification failed.' >&2; ",
        "exit 255"
    ));
    let mut transport = FernyTransport::spawn(command, vec![], true).unwrap();
    match transport.wait().await {
        Err(Error::Ssh(SshError::ChangedHostKey { .. })) => {}
        other => panic!("expected Error::Ssh(ChangedHostKey), got {other:?}"),
    }
}

/// A subprocess that isn't `ssh` never gets its exit code reinterpreted,
/// even if it happens to exit 255.
#[tokio::test]
async fn non_ssh_255_exit_is_a_plain_subprocess_error() {
    init_tracing();
    let mut command = Command::new("sh");
    command.arg("-c").arg("echo oops >&2; exit 255");
    let mut transport = FernyTransport::spawn(command, vec![], false).unwrap();
    match transport.wait().await {
        Err(Error::Subprocess { returncode: 255, stderr }) => assert_eq!(stderr, "oops"),
        other => panic!("expected Error::Subprocess, got {other:?}"),
    }
}

/// A child that never announces `ferny.end` before exiting is a failed
/// connection attempt, not a clean finish.
#[tokio::test]
async fn missing_end_sentinel_is_an_interaction_error() {
    init_tracing();
    let mut command = Command::new("sh");
    command.arg("-c").arg("echo 'still waiting for a password' >&2");
    let mut transport = FernyTransport::spawn(command, vec![], false).unwrap();
    match transport.wait_connected().await {
        Err(Error::Interaction(stderr)) => assert_eq!(stderr, "still waiting for a password"),
        other => panic!("expected Error::Interaction, got {other:?}"),
    }
}
