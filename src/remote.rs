//! Remote command channel for share-mounted targets
//!
//! When the target root is a network share, file data is written through the
//! mount but hard links cannot be created across the wire. They have to be
//! created by the host that owns the filesystem. This module provides:
//!
//! - [`RemoteConfig`]: the login/host/port/root tuple, validated all-or-nothing
//! - [`RemotePathMapper`]: share-local paths to remote native paths
//! - [`RemoteChannel`]: the command channel abstraction, with [`SshChannel`]
//!   shelling out to the system `ssh` client (through `sshpass` when a
//!   password is configured)
//!
//! Connectivity failures surface as [`CommitError::RemoteUnreachable`], which
//! aborts the run. In-flight commands observe the run's cancellation token; a
//! cancelled command has its child process killed.

use crate::error::{BackupError, CommitError, Result};
use crate::queue::CancellationToken;
use std::fmt;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, trace};

const POLL_INTERVAL: Duration = Duration::from_millis(20);
const SSH_UNREACHABLE_EXIT: i32 = 255;
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Connection settings for the remote host that owns the target share
#[derive(Clone, PartialEq, Eq)]
pub struct RemoteConfig {
    /// Login name
    pub login: String,
    /// Password; empty means key-based authentication
    pub password: String,
    /// Host name or address
    pub host: String,
    /// SSH port
    pub port: u16,
    /// Target root as seen on the remote host
    pub remote_root: String,
}

impl fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteConfig")
            .field("login", &self.login)
            .field("password", &"<redacted>")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("remote_root", &self.remote_root)
            .finish()
    }
}

impl RemoteConfig {
    /// Validate the remote flag set
    ///
    /// Either every part is present (remote mode) or none is (local mode).
    /// Anything in between is a configuration error.
    pub fn from_parts(
        login: Option<String>,
        password: Option<String>,
        host: Option<String>,
        remote_root: Option<String>,
        port: Option<String>,
    ) -> Result<Option<Self>> {
        match (login, password, host, remote_root, port) {
            (None, None, None, None, None) => Ok(None),
            (Some(login), Some(password), Some(host), Some(remote_root), Some(port)) => {
                let port = port.trim().parse::<u16>().map_err(|_| {
                    BackupError::configuration(format!("Wrong ssh args: invalid port '{}'", port))
                })?;
                if login.trim().is_empty() || host.trim().is_empty() || remote_root.trim().is_empty() {
                    return Err(BackupError::configuration(
                        "Wrong ssh args: login, host and remote root must not be empty",
                    ));
                }
                Ok(Some(Self {
                    login,
                    password,
                    host,
                    port,
                    remote_root,
                }))
            }
            _ => Err(BackupError::configuration(
                "Wrong ssh args: -sl, -sp, -sh, -sr and -spp must be given together",
            )),
        }
    }

    /// `login@host`
    pub fn destination(&self) -> String {
        format!("{}@{}", self.login, self.host)
    }
}

/// Maps paths under the locally mounted share to remote native paths
#[derive(Debug, Clone)]
pub struct RemotePathMapper {
    share_root: PathBuf,
    remote_root: String,
}

impl RemotePathMapper {
    /// Map `share_root/...` onto `remote_root/...`
    pub fn new(share_root: PathBuf, remote_root: impl Into<String>) -> Self {
        let remote_root = remote_root.into();
        let trimmed = remote_root.trim_end_matches('/');
        let remote_root = if trimmed.is_empty() { "/".to_string() } else { trimmed.to_string() };
        Self {
            share_root,
            remote_root,
        }
    }

    /// Remote path for a share-local path, always `/`-separated
    ///
    /// Names that are not valid UTF-8 cannot be passed through the remote
    /// shell and yield [`CommitError::UnrepresentablePath`].
    pub fn to_remote(&self, local: &Path) -> std::result::Result<String, CommitError> {
        let relative = local.strip_prefix(&self.share_root).map_err(|_| CommitError::Io {
            path: local.to_path_buf(),
            source: std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "path is outside the target share",
            ),
        })?;

        let mut remote = self.remote_root.clone();
        for component in relative.components() {
            if let Component::Normal(part) = component {
                let part = part
                    .to_str()
                    .ok_or_else(|| CommitError::UnrepresentablePath(local.to_path_buf()))?;
                if !remote.ends_with('/') {
                    remote.push('/');
                }
                remote.push_str(part);
            }
        }
        Ok(remote)
    }
}

/// Captured result of a remote command
#[derive(Debug, Clone)]
pub struct RemoteOutput {
    /// Exit status
    pub status: ExitStatus,
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
}

/// Executes commands on the host that owns the target filesystem
pub trait RemoteChannel: Send + Sync {
    /// Check that the host is reachable and accepts commands
    fn probe(&self, token: &CancellationToken) -> std::result::Result<(), CommitError>;

    /// Run a shell command line on the remote host
    fn execute(&self, command: &str, token: &CancellationToken)
        -> std::result::Result<RemoteOutput, CommitError>;

    /// Create a hard link `link` pointing at `existing`, both remote paths
    fn link(
        &self,
        existing: &str,
        link: &str,
        token: &CancellationToken,
    ) -> std::result::Result<(), CommitError> {
        let command = format!("ln -- {} {}", sh_quote(existing), sh_quote(link));
        let output = self.execute(&command, token)?;
        if output.status.success() {
            return Ok(());
        }
        if output.stderr.contains("File exists") {
            return Err(CommitError::DestinationExists(PathBuf::from(link)));
        }
        if output.stderr.contains("Too many links") {
            return Err(CommitError::TooManyLinks(PathBuf::from(existing)));
        }
        Err(CommitError::RemoteCommand {
            command,
            status: output.status.to_string(),
            stderr: output.stderr.trim().to_string(),
        })
    }
}

/// Quote a string for a POSIX shell
pub fn sh_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// [`RemoteChannel`] backed by the system `ssh` client
#[derive(Debug, Clone)]
pub struct SshChannel {
    config: RemoteConfig,
    ssh_program: PathBuf,
    sshpass_program: PathBuf,
}

impl SshChannel {
    /// Channel for `config` using `ssh` and `sshpass` from `PATH`
    pub fn new(config: RemoteConfig) -> Self {
        Self {
            config,
            ssh_program: PathBuf::from("ssh"),
            sshpass_program: PathBuf::from("sshpass"),
        }
    }

    /// Use a specific ssh binary
    pub fn with_ssh_program(mut self, program: PathBuf) -> Self {
        self.ssh_program = program;
        self
    }

    fn build_command(&self, remote_command: &str) -> Command {
        let mut cmd = if self.config.password.is_empty() {
            let mut cmd = Command::new(&self.ssh_program);
            cmd.arg("-o").arg("BatchMode=yes");
            cmd
        } else {
            // Password travels via the environment, never the argument list
            let mut cmd = Command::new(&self.sshpass_program);
            cmd.env("SSHPASS", &self.config.password)
                .arg("-e")
                .arg(&self.ssh_program);
            cmd
        };
        cmd.arg("-p")
            .arg(self.config.port.to_string())
            .arg("-o")
            .arg(format!("ConnectTimeout={}", CONNECT_TIMEOUT_SECS))
            .arg("-o")
            .arg("StrictHostKeyChecking=accept-new")
            .arg(self.config.destination())
            .arg("--")
            .arg(remote_command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}

fn wait_cancellable(
    mut child: Child,
    token: &CancellationToken,
) -> std::result::Result<RemoteOutput, CommitError> {
    // Drained while the command runs so a chatty command cannot fill the pipe
    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);

    let status = loop {
        if token.is_cancelled() {
            let _ = child.kill();
            let _ = child.wait();
            return Err(CommitError::Cancelled);
        }
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(e) => {
                let _ = child.kill();
                return Err(CommitError::RemoteUnreachable(format!(
                    "lost track of ssh process: {}",
                    e
                )));
            }
        }
    };

    Ok(RemoteOutput {
        status,
        stdout: collect(stdout),
        stderr: collect(stderr),
    })
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut bytes = Vec::new();
        let _ = pipe.read_to_end(&mut bytes);
        String::from_utf8_lossy(&bytes).into_owned()
    })
}

fn collect(reader: Option<JoinHandle<String>>) -> String {
    reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

impl RemoteChannel for SshChannel {
    fn probe(&self, token: &CancellationToken) -> std::result::Result<(), CommitError> {
        let output = self.execute("true", token)?;
        if output.status.success() {
            Ok(())
        } else {
            Err(CommitError::RemoteUnreachable(format!(
                "{} rejected probe ({}): {}",
                self.config.destination(),
                output.status,
                output.stderr.trim()
            )))
        }
    }

    fn execute(
        &self,
        command: &str,
        token: &CancellationToken,
    ) -> std::result::Result<RemoteOutput, CommitError> {
        trace!("ssh {}: {}", self.config.destination(), command);
        let child = self.build_command(command).spawn().map_err(|e| {
            CommitError::RemoteUnreachable(format!("cannot start ssh client: {}", e))
        })?;
        let output = wait_cancellable(child, token)?;

        if output.status.code() == Some(SSH_UNREACHABLE_EXIT) {
            debug!("ssh to {} failed: {}", self.config.destination(), output.stderr.trim());
            return Err(CommitError::RemoteUnreachable(format!(
                "{}:{}: {}",
                self.config.host,
                self.config.port,
                output.stderr.trim()
            )));
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn some(s: &str) -> Option<String> {
        Some(s.to_string())
    }

    #[test]
    fn test_remote_flags_all_or_nothing() {
        assert!(RemoteConfig::from_parts(None, None, None, None, None)
            .unwrap()
            .is_none());

        let full = RemoteConfig::from_parts(
            some("backup"),
            some("secret"),
            some("nas.local"),
            some("/volume1/backups"),
            some("22"),
        )
        .unwrap()
        .unwrap();
        assert_eq!(full.port, 22);
        assert_eq!(full.destination(), "backup@nas.local");
        assert!(!format!("{:?}", full).contains("secret"));

        let partial = RemoteConfig::from_parts(some("backup"), None, some("nas.local"), None, None);
        assert!(matches!(partial, Err(BackupError::Configuration(_))));

        let bad_port = RemoteConfig::from_parts(
            some("backup"),
            some(""),
            some("nas.local"),
            some("/r"),
            some("ssh"),
        );
        assert!(matches!(bad_port, Err(BackupError::Configuration(_))));
    }

    #[test]
    fn test_path_mapping() {
        let share = PathBuf::from("/mnt/nas");
        let mapper = RemotePathMapper::new(share.clone(), "/volume1/backups/");
        let local = share.join("2026-01-01_00-00-00").join("files").join("a b.txt");
        assert_eq!(
            mapper.to_remote(&local).unwrap(),
            "/volume1/backups/2026-01-01_00-00-00/files/a b.txt"
        );
        assert!(mapper.to_remote(Path::new("/elsewhere/x")).is_err());

        let root_mapper = RemotePathMapper::new(share.clone(), "/");
        assert_eq!(root_mapper.to_remote(&share.join("x")).unwrap(), "/x");
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_names_are_not_sent_to_the_remote_shell() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;
        let share = PathBuf::from("/mnt/nas");
        let mapper = RemotePathMapper::new(share.clone(), "/volume1");
        let err = mapper
            .to_remote(&share.join(OsStr::from_bytes(b"a\xff")))
            .unwrap_err();
        assert!(matches!(err, CommitError::UnrepresentablePath(_)));
        assert!(err.should_copy_instead());
    }

    #[test]
    fn test_sh_quote() {
        assert_eq!(sh_quote("plain"), "'plain'");
        assert_eq!(sh_quote("it's"), "'it'\\''s'");
    }

    /// `ssh` stand-in that ignores its arguments and runs `body`
    #[cfg(unix)]
    fn fake_ssh(dir: &Path, body: &str) -> SshChannel {
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;
        let program = dir.join("fake-ssh");
        {
            let mut script = std::fs::File::create(&program).unwrap();
            writeln!(script, "#!/bin/sh\n{}", body).unwrap();
            script.sync_all().unwrap();
        }
        std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755)).unwrap();
        let config = RemoteConfig {
            login: "u".into(),
            password: String::new(),
            host: "127.0.0.1".into(),
            port: 22,
            remote_root: "/r".into(),
        };
        SshChannel::new(config).with_ssh_program(program)
    }

    #[cfg(unix)]
    #[test]
    fn test_large_command_output_does_not_block() {
        let dir = tempfile::TempDir::new().unwrap();
        // Well past any pipe buffer
        let channel = fake_ssh(
            dir.path(),
            "head -c 300000 /dev/zero | tr '\\0' x\nhead -c 300000 /dev/zero | tr '\\0' y >&2",
        );
        let output = channel.execute("ls -R /", &CancellationToken::new()).unwrap();
        assert!(output.status.success());
        assert_eq!(output.stdout.len(), 300_000);
        assert_eq!(output.stderr.len(), 300_000);
    }

    #[cfg(unix)]
    #[test]
    fn test_remote_link_limit_maps_to_too_many_links() {
        let dir = tempfile::TempDir::new().unwrap();
        let channel = fake_ssh(
            dir.path(),
            "echo \"ln: failed to create hard link '/r/b': Too many links\" >&2\nexit 1",
        );
        let err = channel
            .link("/r/a", "/r/b", &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, CommitError::TooManyLinks(_)), "{:?}", err);
        assert!(err.should_copy_instead());
    }

    #[test]
    fn test_missing_ssh_binary_is_unreachable() {
        let config = RemoteConfig {
            login: "u".into(),
            password: String::new(),
            host: "127.0.0.1".into(),
            port: 22,
            remote_root: "/r".into(),
        };
        let channel = SshChannel::new(config)
            .with_ssh_program(PathBuf::from("/nonexistent/hlbackup-test-ssh"));
        let err = channel.probe(&CancellationToken::new()).unwrap_err();
        assert!(err.is_connectivity_loss());
    }
}
