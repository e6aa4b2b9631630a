//! spec.md §8 "Frame robustness": a remote (in-band) command frame split
//! across multiple socket reads at an arbitrary byte boundary must still be
//! recognized and dispatched exactly once, in order, with ordinary stderr
//! text on either side of it left untouched.

use std::sync::{Arc, Mutex};

use pretty_assertions::assert_eq;
use tokio::process::Command;

use ferny::frame;
use ferny::handler::{BoxFuture, HandlerError, InteractionHandler};
use ferny::literal::Literal;
use ferny::transport::FernyTransport;

#[derive(Default)]
struct Recorder {
    seen: Arc<Mutex<Vec<(String, String)>>>,
}

impl InteractionHandler for Recorder {
    fn commands(&self) -> Vec<&'static str> {
        vec!["ferny.test"]
    }

    fn run_command<'a>(
        &'a self,
        command: &'a str,
        args: Vec<Literal>,
        fds: Vec<std::os::fd::OwnedFd>,
        stderr: String,
    ) -> BoxFuture<'a, Result<(), HandlerError>> {
        assert!(fds.is_empty(), "remote commands never carry fds");
        let payload = ferny::literal::to_string(&Literal::Tuple(args));
        self.seen.lock().unwrap().push((command.to_owned(), payload));
        let _ = stderr;
        Box::pin(async { Ok(()) })
    }
}

#[tokio::test]
async fn a_frame_split_across_reads_is_still_recognized() {
    let frame = frame::encode_remote("ferny.test", &[Literal::Str("hello".into()), Literal::Int(42)]);
    // Split the frame roughly in the middle, at a byte boundary that lands
    // inside the payload, not on a frame-marker boundary.
    let split_at = frame.len() / 2;
    let (first_half, second_half) = frame.split_at(split_at);

    let mut script = String::new();
    script.push_str("printf 'before\\n' >&2; ");
    script.push_str(&format!("printf '%b' '{}' >&2; ", shell_bytes(first_half)));
    script.push_str("sleep 0.1; ");
    script.push_str(&format!("printf '%b' '{}' >&2; ", shell_bytes(second_half)));
    script.push_str("printf 'after\\n' >&2; ");
    let end_frame = frame::encode_remote("ferny.end", &[]);
    script.push_str(&format!("printf '%b' '{}' >&2", shell_bytes(&end_frame)));

    let mut command = Command::new("sh");
    command.arg("-c").arg(script);

    let recorder = Recorder::default();
    let seen = recorder.seen.clone();
    let mut transport = FernyTransport::spawn(command, vec![Box::new(recorder)], false).unwrap();

    transport.wait_connected().await.expect("ferny.end should still arrive after the split frame");

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1, "the split frame should be dispatched exactly once");
    assert_eq!(seen[0].0, "ferny.test");
    assert_eq!(seen[0].1, "('hello', 42)");
}

/// Render raw bytes as a `printf %b`-compatible octal-escaped string.
fn shell_bytes(bytes: &[u8]) -> String {
    let mut out = String::new();
    for &b in bytes {
        out.push_str(&format!("\\{:03o}", b));
    }
    out
}
