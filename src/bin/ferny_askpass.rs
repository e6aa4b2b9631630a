//! Standalone binary `ssh` invokes as `$SSH_ASKPASS`, `LocalCommand`, or
//! `KnownHostsCommand`. All the logic lives in [`ferny::askpass::interact`];
//! this is just the thin argv/env/exit-code plumbing.

use std::collections::HashMap;
use std::os::fd::RawFd;

const STDERR_FD: RawFd = 2;
const STDOUT_FD: RawFd = 1;

fn main() {
    let argv: Vec<String> = std::env::args().collect();
    let env: HashMap<String, String> = std::env::vars().collect();

    let status = match ferny::askpass::interact(STDERR_FD, STDOUT_FD, argv, env) {
        Ok(status) => status,
        Err(e) => {
            eprintln!("ferny-askpass: {e}");
            1
        }
    };
    std::process::exit(status);
}
