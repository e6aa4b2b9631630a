//! Scenario from spec.md §8: if the askpass client dies while a handler's
//! `do_askpass` is still suspended (e.g. waiting on a real human who'll
//! never answer, like a FIDO presence prompt), killing the askpass process
//! must cancel that handler exactly once, with no answer written and every
//! fd released. Mirrors
//! `examples/original_source/test/test_agent.py`'s "killed askpass"
//! fixture, driven against the real `ferny-askpass` binary instead of a
//! mock client.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::process::Command;

use ferny::handler::{Askpass, AskpassHandler, BoxFuture};
use ferny::transport::FernyTransport;
use ferny::Error;

/// Never answers; records whether it was ever dropped without completing.
struct HangingAskpass {
    cancelled: Arc<AtomicBool>,
}

struct SetOnDrop(Arc<AtomicBool>);

impl Drop for SetOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl AskpassHandler for HangingAskpass {
    fn do_askpass<'a>(&'a self, _stderr: &'a str, _prompt: &'a str, _hint: &'a str) -> BoxFuture<'a, Option<String>> {
        let guard = SetOnDrop(self.cancelled.clone());
        Box::pin(async move {
            let _guard = guard;
            std::future::pending::<()>().await;
            unreachable!("never answers, so this future is only ever dropped, not polled to completion");
        })
    }
}

fn open_fd_count() -> usize {
    std::fs::read_dir("/proc/self/fd").map(|entries| entries.count()).unwrap_or(0)
}

#[tokio::test]
async fn killed_askpass_cancels_the_in_flight_handler() {
    let askpass_path = env!("CARGO_BIN_EXE_ferny-askpass");
    let cancelled = Arc::new(AtomicBool::new(false));

    let baseline_fds = open_fd_count();

    let mut command = Command::new("sh");
    command.arg("-c").arg(concat!(
        "echo 'warning: it works' >&2; ",
        "\"$1\" 'can has pw?' & ",
        "pid=$!; ",
        "sleep 0.3; ",
        "kill -9 \"$pid\" 2>/dev/null; ",
        "wait \"$pid\" 2>/dev/null; ",
        "printf 'we killed askpass' >&2"
    ));
    command.arg("sh").arg(askpass_path);

    let handler = Box::new(Askpass(HangingAskpass { cancelled: cancelled.clone() }));
    let mut transport = FernyTransport::spawn(command, vec![handler], false).unwrap();

    match transport.wait_connected().await {
        Err(Error::Interaction(stderr)) => assert_eq!(stderr, "we killed askpass"),
        other => panic!("expected Error::Interaction(\"we killed askpass\"), got {other:?}"),
    }

    // The handler task's own `status_fd` race resolves independently of
    // `wait_connected()` returning; give it a little room to be scheduled
    // and drop its guard before asserting.
    for _ in 0..20 {
        if cancelled.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
    }
    assert!(cancelled.load(Ordering::SeqCst), "do_askpass should have been cancelled, not left to finish");
    assert_eq!(open_fd_count(), baseline_fds, "no fd should leak across a cancelled askpass interaction");
}
