//! Process execution and supervision.
//!
//! Every command started here is tied to a `CancellationToken`. When the token
//! fires, the child receives SIGTERM, then SIGKILL once the grace period runs
//! out, and it is always reaped before the call returns. `kill` applies the
//! same escalation to processes this crate does not own (tmux panes, members
//! of a detached process group).

use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use futures::future::try_join_all;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// How long a signalled process gets before it is killed.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(20);

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const KILL_WAIT: Duration = Duration::from_secs(5);

/// Signals used while shutting processes down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    SigInt,
    SigTerm,
    SigKill,
}

impl ProcessSignal {
    pub fn label(&self) -> &'static str {
        match self {
            ProcessSignal::SigInt => "SIGINT",
            ProcessSignal::SigTerm => "SIGTERM",
            ProcessSignal::SigKill => "SIGKILL",
        }
    }

    fn raw(self) -> libc::c_int {
        match self {
            ProcessSignal::SigInt => libc::SIGINT,
            ProcessSignal::SigTerm => libc::SIGTERM,
            ProcessSignal::SigKill => libc::SIGKILL,
        }
    }
}

/// Runs a command to completion, terminating it if `cancel` fires first.
pub async fn run(cancel: &CancellationToken, cmd: Command) -> Result<()> {
    run_with_grace(cancel, cmd, DEFAULT_GRACE).await
}

/// Like `run`, giving the command `grace` to exit after SIGTERM on cancellation.
pub async fn run_with_grace(
    cancel: &CancellationToken,
    mut cmd: Command,
    grace: Duration,
) -> Result<()> {
    let (mut child, command) = spawn(&mut cmd)?;
    supervise(cancel, &mut child, &command, grace).await
}

/// Runs commands one after another, stopping at the first failure.
pub async fn run_all(cancel: &CancellationToken, cmds: Vec<Command>) -> Result<()> {
    for cmd in cmds {
        run(cancel, cmd).await?;
    }
    Ok(())
}

/// Runs a command and returns everything it wrote to stdout.
pub async fn output(cancel: &CancellationToken, mut cmd: Command) -> Result<String> {
    cmd.stdout(Stdio::piped());
    let (mut child, command) = spawn(&mut cmd)?;
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::other("stdout was not captured"))?;

    let read = async {
        let mut buf = String::new();
        stdout.read_to_string(&mut buf).await.map(|_| buf)
    };
    let supervised = supervise(cancel, &mut child, &command, DEFAULT_GRACE);
    let (buf, status) = tokio::join!(read, supervised);
    status?;
    Ok(buf?)
}

/// Runs a command with `input` written to its stdin.
pub async fn run_with_input(
    cancel: &CancellationToken,
    mut cmd: Command,
    input: Vec<u8>,
) -> Result<()> {
    cmd.stdin(Stdio::piped());
    let (mut child, command) = spawn(&mut cmd)?;
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| io::Error::other("stdin was not captured"))?;

    let write = async move {
        stdin.write_all(&input).await?;
        stdin.shutdown().await
    };
    let supervised = supervise(cancel, &mut child, &command, DEFAULT_GRACE);
    let (written, status) = tokio::join!(write, supervised);
    status?;
    Ok(written?)
}

/// Starts a command that outlives the caller and returns its pid.
///
/// The child is neither awaited nor killed when the handle is dropped.
pub fn spawn_detached(mut cmd: Command) -> Result<i32> {
    let command = format!("{:?}", cmd.as_std());
    debug!(cmd = %command, "Starting detached command");
    let child = cmd.spawn().map_err(|source| Error::Spawn {
        command: command.clone(),
        source,
    })?;
    child
        .id()
        .map(|pid| pid as i32)
        .ok_or_else(|| io::Error::other(format!("{command} exited before reporting its pid")).into())
}

/// Moves the command's process into group `pgid` before it executes.
///
/// `0` starts a new group led by the process itself.
pub fn join_group(cmd: &mut Command, pgid: i32) {
    // SAFETY: setpgid is async-signal-safe and the closure allocates nothing.
    unsafe {
        cmd.pre_exec(move || {
            if libc::setpgid(0, pgid) == 0 {
                Ok(())
            } else {
                Err(io::Error::last_os_error())
            }
        });
    }
}

/// Terminates processes concurrently: SIGTERM, wait up to `grace`, SIGKILL.
///
/// Processes that are already gone are skipped silently.
pub async fn kill(cancel: &CancellationToken, pids: &[i32], grace: Duration) -> Result<()> {
    try_join_all(pids.iter().map(|&pid| kill_one(cancel, pid, grace))).await?;
    Ok(())
}

/// Lists live processes whose process group is `pgid`, excluding ourselves.
pub fn group_members(pgid: i32) -> io::Result<Vec<i32>> {
    let own = std::process::id() as i32;
    let mut members = Vec::new();
    for entry in std::fs::read_dir("/proc")? {
        let entry = entry?;
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<i32>().ok())
        else {
            continue;
        };
        if pid == own {
            continue;
        }
        let Some(stat) = read_stat(pid)? else {
            continue;
        };
        if stat.pgid == pgid && stat.state != 'Z' {
            members.push(pid);
        }
    }
    members.sort_unstable();
    Ok(members)
}

/// Sends `signal` to `pid`. Returns `false` if the process no longer exists.
pub fn send_signal(pid: i32, signal: ProcessSignal) -> io::Result<bool> {
    if pid <= 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("refusing to signal pid {pid}"),
        ));
    }
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid, signal.raw()) };
    if rc == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(false)
    } else {
        Err(err)
    }
}

/// Reports whether `pid` exists and is not a zombie.
pub fn is_alive(pid: i32) -> io::Result<bool> {
    if pid <= 0 {
        return Ok(false);
    }
    // SAFETY: signal 0 only checks for existence.
    let rc = unsafe { libc::kill(pid, 0) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ESRCH) => return Ok(false),
            Some(libc::EPERM) => {}
            _ => return Err(err),
        }
    }
    Ok(read_stat(pid)?.is_some_and(|stat| stat.state != 'Z'))
}

/// Opens the controlling terminal for interactive hand-off.
///
/// `/dev/stdin` may point at `/dev/null` when launched from wrappers, while
/// `/proc/self/fd/1` still resolves to the real tty.
pub fn tty() -> io::Result<std::fs::File> {
    std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/proc/self/fd/1")
}

/// Renders a program and its arguments as a single shell-safe string.
pub fn shell_join(program: &Path, args: &[String]) -> String {
    let program = program.to_string_lossy();
    std::iter::once(shell_words::quote(&program))
        .chain(args.iter().map(|arg| shell_words::quote(arg)))
        .collect::<Vec<_>>()
        .join(" ")
}

fn spawn(cmd: &mut Command) -> Result<(Child, String)> {
    let command = format!("{:?}", cmd.as_std());
    debug!(cmd = %command, "Executing command");
    cmd.kill_on_drop(true);
    let child = cmd.spawn().map_err(|source| Error::Spawn {
        command: command.clone(),
        source,
    })?;
    Ok((child, command))
}

async fn supervise(
    cancel: &CancellationToken,
    child: &mut Child,
    command: &str,
    grace: Duration,
) -> Result<()> {
    tokio::select! {
        status = child.wait() => {
            let status = status?;
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            check_status(command, status)
        }
        _ = cancel.cancelled() => {
            terminate(child, grace).await?;
            Err(Error::Cancelled)
        }
    }
}

fn check_status(command: &str, status: ExitStatus) -> Result<()> {
    if status.success() {
        Ok(())
    } else {
        Err(Error::CommandFailed {
            command: command.to_string(),
            status,
        })
    }
}

async fn terminate(child: &mut Child, grace: Duration) -> Result<ExitStatus> {
    if let Some(pid) = child.id() {
        send_signal(pid as i32, ProcessSignal::SigTerm)?;
    }
    if let Some(status) = wait_for_exit(child, grace).await? {
        return Ok(status);
    }
    warn!(pid = ?child.id(), ?grace, "Process ignored SIGTERM, killing it");
    child.kill().await?;
    Ok(child.wait().await?)
}

async fn wait_for_exit(child: &mut Child, timeout: Duration) -> Result<Option<ExitStatus>> {
    if timeout.is_zero() {
        return Ok(None);
    }
    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => Ok(Some(status)),
        Ok(Err(err)) => Err(err.into()),
        Err(_) => Ok(None),
    }
}

async fn kill_one(cancel: &CancellationToken, pid: i32, grace: Duration) -> Result<()> {
    if !is_alive(pid)? {
        return Ok(());
    }
    debug!(pid, "Sending SIGTERM");
    if !send_signal(pid, ProcessSignal::SigTerm)? {
        return Ok(());
    }
    tokio::select! {
        _ = cancel.cancelled() => return Err(Error::Cancelled),
        gone = wait_gone(pid, grace) => {
            if gone? {
                return Ok(());
            }
        }
    }

    warn!(pid, ?grace, "Process still running after grace period, sending SIGKILL");
    if !send_signal(pid, ProcessSignal::SigKill)? {
        return Ok(());
    }
    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled),
        gone = wait_gone(pid, KILL_WAIT) => {
            if gone? {
                Ok(())
            } else {
                Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("process {pid} survived SIGKILL"),
                )
                .into())
            }
        }
    }
}

async fn wait_gone(pid: i32, timeout: Duration) -> io::Result<bool> {
    let deadline = Instant::now() + timeout;
    loop {
        if !is_alive(pid)? {
            return Ok(true);
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ProcStat {
    state: char,
    pgid: i32,
}

fn read_stat(pid: i32) -> io::Result<Option<ProcStat>> {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(raw) => Ok(parse_stat(&raw)),
        Err(err)
            if err.kind() == io::ErrorKind::NotFound
                || err.raw_os_error() == Some(libc::ESRCH) =>
        {
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

// The command name is wrapped in parentheses and may itself contain spaces.
fn parse_stat(raw: &str) -> Option<ProcStat> {
    let rest = &raw[raw.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let _ppid = fields.next()?;
    let pgid = fields.next()?.parse().ok()?;
    Some(ProcStat { state, pgid })
}
