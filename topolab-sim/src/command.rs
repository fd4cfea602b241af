//! Commands issued against the host, and the [`Backend`] that runs them.
//!
//! Every side effect of the emulation (namespaces, veth pairs, routes, qdiscs, terminals) is a
//! [`Cmd`] handed to a [`Backend`]. [`LinuxBackend`] spawns real processes; [`RecordingBackend`]
//! keeps them in memory, which is what tests and dry runs use.

use std::{fmt, io, process::Stdio};

use async_trait::async_trait;
use parking_lot::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("empty command provided")]
    Empty,
    #[error("io error running `{cmd}`: {source}")]
    Io {
        cmd: String,
        #[source]
        source: io::Error,
    },
    #[error("`{}` exited with code {:?}: {}", .cmd, .output.code, .output.stderr.trim())]
    NonZero { cmd: String, output: Output },
}

pub type Result<T> = std::result::Result<T, Error>;

/// The captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Output {
    /// Exit code, `None` if the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl Output {
    pub const fn success(&self) -> bool {
        matches!(self.code, Some(0))
    }
}

impl From<std::process::Output> for Output {
    fn from(value: std::process::Output) -> Self {
        Self {
            code: value.status.code(),
            stdout: String::from_utf8_lossy(&value.stdout).to_string(),
            stderr: String::from_utf8_lossy(&value.stderr).to_string(),
        }
    }
}

/// A command, optionally scoped to a network namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    pub namespace: Option<String>,
    pub argv: Vec<String>,
}

impl Cmd {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { namespace: None, argv: argv.into_iter().map(Into::into).collect() }
    }

    /// Builds the command from a string, separating args with whitespaces.
    pub fn by_str(cmd: &str) -> Self {
        Self::new(cmd.split_ascii_whitespace())
    }

    /// Run this command inside the given network namespace.
    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// The arguments as executed on the host, including the `ip netns exec` prefix.
    pub fn host_argv(&self) -> Vec<String> {
        match &self.namespace {
            Some(ns) => ["ip", "netns", "exec", ns.as_str()]
                .into_iter()
                .map(str::to_string)
                .chain(self.argv.iter().cloned())
                .collect(),
            None => self.argv.clone(),
        }
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.host_argv().join(" "))
    }
}

/// Executes [`Cmd`]s on behalf of the emulation.
#[async_trait]
pub trait Backend: fmt::Debug + Send + Sync + 'static {
    /// Runs the command to completion and returns its output, whatever the exit status.
    async fn output(&self, cmd: &Cmd) -> Result<Output>;

    /// Spawns the command without waiting for it. Returns the process id, if any.
    fn spawn(&self, cmd: &Cmd) -> Result<Option<u32>>;

    /// Runs the command to completion, failing on a non-zero exit status.
    async fn run(&self, cmd: &Cmd) -> Result<Output> {
        let output = self.output(cmd).await?;

        if !output.success() {
            tracing::debug!(%cmd, ?output.code, stderr = output.stderr.trim(), "command returned non-zero status");
            return Err(Error::NonZero { cmd: cmd.to_string(), output });
        }

        Ok(output)
    }
}

/// Runs commands as real processes on the host.
#[derive(Debug, Clone, Default)]
pub struct LinuxBackend {
    sudo: bool,
}

impl LinuxBackend {
    /// When `sudo` is set, every command is prefixed with `sudo`.
    pub const fn new(sudo: bool) -> Self {
        Self { sudo }
    }

    /// Whether commands will run with enough privileges to manage namespaces.
    pub fn is_privileged(&self) -> bool {
        self.sudo || nix::unistd::Uid::effective().is_root()
    }

    fn command(&self, cmd: &Cmd) -> Result<tokio::process::Command> {
        let argv = cmd.host_argv();
        let mut iter = argv.iter();
        let program = iter.next().ok_or(Error::Empty)?;

        let mut command = if self.sudo {
            let mut command = tokio::process::Command::new("sudo");
            command.arg(program);
            command
        } else {
            tokio::process::Command::new(program)
        };
        command.args(iter);

        Ok(command)
    }
}

#[async_trait]
impl Backend for LinuxBackend {
    async fn output(&self, cmd: &Cmd) -> Result<Output> {
        let mut command = self.command(cmd)?;
        command.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());

        tracing::debug!(%cmd, "running command");

        let output = command
            .output()
            .await
            .map_err(|source| Error::Io { cmd: cmd.to_string(), source })?;

        Ok(output.into())
    }

    fn spawn(&self, cmd: &Cmd) -> Result<Option<u32>> {
        let mut command = self.command(cmd)?;
        command.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());

        tracing::debug!(%cmd, "spawning command");

        let child = command.spawn().map_err(|source| Error::Io { cmd: cmd.to_string(), source })?;
        Ok(child.id())
    }
}

#[derive(Debug, Default)]
struct Recording {
    commands: Vec<Cmd>,
    spawned: Vec<Cmd>,
    failures: Vec<String>,
    responses: Vec<(String, String)>,
}

impl Recording {
    fn matches(patterns: &[String], rendered: &str) -> bool {
        patterns.iter().any(|p| rendered.contains(p.as_str()))
    }
}

/// Records commands instead of running them.
///
/// Every command succeeds with empty output unless a failure or a canned response was
/// registered for it.
#[derive(Debug, Default)]
pub struct RecordingBackend {
    inner: Mutex<Recording>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every command whose rendered form contains `pattern` exit with code 1.
    pub fn fail_on(&self, pattern: impl Into<String>) {
        self.inner.lock().failures.push(pattern.into());
    }

    /// Reply with `stdout` to every command whose rendered form contains `pattern`.
    pub fn respond(&self, pattern: impl Into<String>, stdout: impl Into<String>) {
        self.inner.lock().responses.push((pattern.into(), stdout.into()));
    }

    /// The commands run so far, in order.
    pub fn commands(&self) -> Vec<Cmd> {
        self.inner.lock().commands.clone()
    }

    /// The commands run so far, rendered as they would be executed on the host.
    pub fn rendered(&self) -> Vec<String> {
        self.inner.lock().commands.iter().map(ToString::to_string).collect()
    }

    /// The commands spawned so far.
    pub fn spawned(&self) -> Vec<Cmd> {
        self.inner.lock().spawned.clone()
    }

    /// Forget recorded commands. Failures and responses are kept.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.commands.clear();
        inner.spawned.clear();
    }
}

#[async_trait]
impl Backend for RecordingBackend {
    async fn output(&self, cmd: &Cmd) -> Result<Output> {
        if cmd.argv.is_empty() {
            return Err(Error::Empty);
        }

        let rendered = cmd.to_string();
        tracing::debug!(cmd = %rendered, "recording command");

        let mut inner = self.inner.lock();
        inner.commands.push(cmd.clone());

        if Recording::matches(&inner.failures, &rendered) {
            return Ok(Output {
                code: Some(1),
                stdout: String::new(),
                stderr: "injected failure".to_string(),
            });
        }

        let stdout = inner
            .responses
            .iter()
            .find(|(pattern, _)| rendered.contains(pattern.as_str()))
            .map(|(_, stdout)| stdout.clone())
            .unwrap_or_default();

        Ok(Output { code: Some(0), stdout, stderr: String::new() })
    }

    fn spawn(&self, cmd: &Cmd) -> Result<Option<u32>> {
        if cmd.argv.is_empty() {
            return Err(Error::Empty);
        }

        let rendered = cmd.to_string();
        let mut inner = self.inner.lock();
        if Recording::matches(&inner.failures, &rendered) {
            return Err(Error::Io { cmd: rendered, source: io::Error::other("injected failure") });
        }

        inner.spawned.push(cmd.clone());
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cmd_renders_namespace_prefix() {
        let cmd = Cmd::by_str("ip link set lo up").in_namespace("tl-0001-h1");
        assert_eq!(cmd.to_string(), "ip netns exec tl-0001-h1 ip link set lo up");

        let cmd = Cmd::new(["ip", "netns", "add", "tl-0001-h1"]);
        assert_eq!(cmd.to_string(), "ip netns add tl-0001-h1");
    }

    #[tokio::test]
    async fn recording_backend_injects_failures() {
        let backend = RecordingBackend::new();
        backend.fail_on("netns add tl-0001-h2");

        backend.run(&Cmd::by_str("ip netns add tl-0001-h1")).await.unwrap();
        let err = backend.run(&Cmd::by_str("ip netns add tl-0001-h2")).await.unwrap_err();

        assert!(matches!(err, Error::NonZero { .. }), "unexpected error: {err}");
        assert_eq!(backend.commands().len(), 2);
    }

    #[tokio::test]
    async fn recording_backend_returns_canned_output() {
        let backend = RecordingBackend::new();
        backend.respond("ip route show", "default via 10.0.0.1 dev h1-eth0\n");

        let output = backend.output(&Cmd::by_str("ip route show").in_namespace("ns")).await.unwrap();
        assert!(output.success());
        assert_eq!(output.stdout, "default via 10.0.0.1 dev h1-eth0\n");
    }

    #[tokio::test]
    async fn empty_command_is_rejected() {
        let backend = RecordingBackend::new();
        assert!(matches!(backend.run(&Cmd::by_str("   ")).await, Err(Error::Empty)));
        assert!(matches!(LinuxBackend::new(false).run(&Cmd::by_str("")).await, Err(Error::Empty)));
    }

    #[tokio::test]
    async fn linux_backend_captures_output() {
        let backend = LinuxBackend::new(false);

        let output = backend.output(&Cmd::new(["sh", "-c", "echo hello; exit 3"])).await.unwrap();
        assert_eq!(output.code, Some(3));
        assert_eq!(output.stdout, "hello\n");
        assert!(backend.run(&Cmd::new(["sh", "-c", "exit 3"])).await.is_err());
    }
}
