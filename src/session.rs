//! A single control-master `ssh` connection, plus the means to run further
//! commands multiplexed over it.
//!
//! Grounded in `examples/original_source/src/ferny/session.py`'s `Session`
//! (argv assembly, control socket lifecycle, `has_feature` probing) and the
//! teacher's `SessionBuilder`/`process_impl::Session` (control-socket
//! tempdir, shell-quoted remote argv).

use std::collections::HashMap;
use std::env;
use std::ffi::OsStr;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;

use once_cell::sync::Lazy;
use tempfile::TempDir;
use tokio::process::Command;

use crate::error::Error;
use crate::handler::InteractionHandler;
use crate::transport::FernyTransport;

static FEATURE_CACHE: Lazy<Mutex<HashMap<String, bool>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// Probe whether the locally installed `ssh` understands `-o<feature>=...`,
/// caching the result for the life of the process. Used to decide whether
/// `KnownHostsCommand` can be added to the control-master invocation.
fn has_feature(feature: &str) -> bool {
    if let Some(&cached) = FEATURE_CACHE.lock().unwrap().get(feature) {
        return cached;
    }
    let result = std::process::Command::new("ssh")
        .arg(format!("-o{feature} x"))
        .arg("-G")
        .arg("nonexisting")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false);
    FEATURE_CACHE.lock().unwrap().insert(feature.to_owned(), result);
    result
}

/// Copy the askpass helper binary into the connection's own control
/// directory, so `ssh`'s `LocalCommand`/`KnownHostsCommand` invocation
/// always resolves to a known, executable path that outlives wherever
/// `source` happened to be found (a sibling directory, `PATH`, ...).
fn materialize_askpass(source: &Path, controldir: &Path) -> std::io::Result<PathBuf> {
    use std::os::unix::fs::PermissionsExt;

    let dest = controldir.join("ferny-askpass");
    std::fs::copy(source, &dest)?;
    let mut perms = std::fs::metadata(&dest)?.permissions();
    perms.set_mode(0o700);
    std::fs::set_permissions(&dest, perms)?;
    Ok(dest)
}

fn default_askpass_path() -> PathBuf {
    if let Ok(exe) = env::current_exe() {
        if let Some(dir) = exe.parent() {
            let candidate = dir.join("ferny-askpass");
            if candidate.is_file() {
                return candidate;
            }
        }
    }
    PathBuf::from("ferny-askpass")
}

/// Parameters for [`Session::connect`], mirroring `Session.connect`'s
/// keyword arguments.
#[derive(Default)]
pub struct ConnectOptions<'a> {
    /// Add a `KnownHostsCommand` so unknown/changed host keys are routed to
    /// the interaction handler instead of failing outright.
    pub handle_host_key: bool,
    pub config_file: Option<&'a Path>,
    pub identity_file: Option<&'a Path>,
    pub login_name: Option<&'a str>,
    pub options: &'a [(&'a str, &'a str)],
    pub pkcs11: Option<&'a str>,
    pub port: Option<u16>,
    /// Path to the `ferny-askpass` binary. Defaults to a sibling of the
    /// current executable, falling back to a `PATH` lookup.
    pub askpass_path: Option<PathBuf>,
}

/// A control-master `ssh` connection, kept alive in the background while the
/// caller runs zero or more multiplexed remote commands over it.
pub struct Session {
    transport: FernyTransport,
    _controldir: TempDir,
    controlsock: PathBuf,
}

impl Session {
    /// Establish a control-master connection to `destination`, mediating
    /// every interactive prompt through `interaction_handler` (if any).
    pub async fn connect(
        destination: &str,
        opts: ConnectOptions<'_>,
        interaction_handler: Option<Box<dyn InteractionHandler>>,
    ) -> Result<Self, Error> {
        let rundir = dirs::runtime_dir().unwrap_or_else(|| env::temp_dir()).join("ferny");
        std::fs::create_dir_all(&rundir).map_err(Error::Io)?;
        let controldir = tempfile::Builder::new().prefix("ferny-").tempdir_in(&rundir).map_err(Error::Io)?;
        let controlsock = controldir.path().join("socket");

        let askpass_source = opts.askpass_path.clone().unwrap_or_else(default_askpass_path);
        let askpass_path = materialize_askpass(&askpass_source, controldir.path()).map_err(Error::Io)?;
        let askpass_display = askpass_path.display();

        let mut args: Vec<String> = vec![
            "-M".into(),
            "-N".into(),
            "-S".into(),
            controlsock.display().to_string(),
            "-o".into(),
            "PermitLocalCommand=yes".into(),
            "-o".into(),
            format!("LocalCommand={askpass_display}"),
        ];

        if let Some(config_file) = opts.config_file {
            args.push(format!("-F{}", config_file.display()));
        }
        if let Some(identity_file) = opts.identity_file {
            args.push(format!("-i{}", identity_file.display()));
        }
        for (key, value) in opts.options {
            args.push(format!("-o{key} {value}"));
        }
        if let Some(pkcs11) = opts.pkcs11 {
            args.push(format!("-I{pkcs11}"));
        }
        if let Some(port) = opts.port {
            args.push(format!("-p{port}"));
        }
        if let Some(login_name) = opts.login_name {
            args.push(format!("-l{login_name}"));
        }
        if opts.handle_host_key && has_feature("KnownHostsCommand") {
            args.push("-o".into());
            args.push(format!("KnownHostsCommand={askpass_display} %I %H %t %K %f"));
            args.push("-o".into());
            args.push("StrictHostKeyChecking=yes".into());
        }
        args.push(destination.to_owned());

        let mut command = Command::new("ssh");
        command
            .args(&args)
            .env("SSH_ASKPASS", &askpass_path)
            .env("SSH_ASKPASS_REQUIRE", "force")
            .env("DISPLAY", "-")
            .stdin(Stdio::null())
            .process_group(0);

        // SAFETY: prctl/PR_SET_PDEATHSIG is async-signal-safe and touches no
        // Rust state; this ensures ssh doesn't outlive us if we're killed.
        unsafe {
            command.pre_exec(|| {
                libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong, 0, 0, 0);
                Ok(())
            });
        }

        let handlers: Vec<Box<dyn InteractionHandler>> = interaction_handler.into_iter().collect();
        let mut transport = FernyTransport::spawn(command, handlers, true)?;

        if let Err(e) = transport.wait_connected().await {
            let _ = transport.close().await;
            return Err(e);
        }

        Ok(Self { transport, _controldir: controldir, controlsock })
    }

    /// Wait for the control master to exit.
    pub async fn wait(&mut self) -> Result<(), Error> {
        self.transport.wait().await
    }

    /// Terminate the control master and wait for it to exit.
    pub async fn disconnect(&mut self) -> Result<(), Error> {
        self.transport.close().await
    }

    /// Build a `ssh` invocation that runs `program` with `args` on the
    /// remote host, reusing this session's control socket. `program` is
    /// shell-escaped so it isn't reinterpreted by the remote shell.
    pub fn command(&self, program: &str, args: &[&str]) -> Command {
        let escaped = shell_escape::unix::escape(std::borrow::Cow::Borrowed(program));
        self.raw_command(&escaped, args)
    }

    /// Like [`Session::command`], but `program` is passed to the remote
    /// shell unescaped, so it may itself contain shell syntax.
    pub fn raw_command(&self, program: &str, args: &[&str]) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-S").arg(&self.controlsock).arg("").arg(program);
        for arg in args {
            let escaped = shell_escape::unix::escape(std::borrow::Cow::Borrowed(*arg));
            cmd.arg(escaped.into_owned());
        }
        cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
        cmd
    }

    /// Path to this session's control socket, for callers that need to
    /// drive `ssh -S <sock> -O ...` themselves.
    pub fn control_socket(&self) -> &OsStr {
        self.controlsock.as_os_str()
    }
}
