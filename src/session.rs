//! A tmux session holding one window per app.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::runner;
use crate::tools::Tools;

const HELP: &str = "
  Keys:

    Ctrl-b 0..9    jump to window 0..9
    Ctrl-b p / n   previous / next window
    Ctrl-b w       pick a window from a list
    Ctrl-b [       scrollback (Ctrl-s searches, ESC leaves)
    Ctrl-b d       detach and leave everything running

  Windows:

    Ctrl-C interrupts the app in the current window.
    Ctrl-\\ sends SIGQUIT.
    Windows of exited apps stay open so their output can be read.
    Run `localnet stop` to shut everything down.
";

/// Keeps a pane open after its program exits, ignoring keyboard input.
const IDLE_LOOP: &str = "while :; do read -sr; done";

pub struct Session {
    tools: Tools,
    name: String,
    log_dir: PathBuf,
}

impl Session {
    pub fn new(tools: Tools, name: impl Into<String>, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            tools,
            name: name.into(),
            log_dir: log_dir.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn exists(&self, cancel: &CancellationToken) -> Result<bool> {
        let mut cmd = self.tmux(["has-session", "-t", self.name.as_str()])?;
        cmd.stdout(Stdio::null()).stderr(Stdio::null());
        match runner::run(cancel, cmd).await {
            Ok(()) => Ok(true),
            Err(Error::CommandFailed { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Creates the session with a help window unless it already exists.
    pub async fn init(&self, cancel: &CancellationToken) -> Result<()> {
        if self.exists(cancel).await? {
            return Ok(());
        }
        info!(session = %self.name, "Creating tmux session");
        let cmd = self.tmux([
            "new-session",
            "-d",
            "-s",
            self.name.as_str(),
            "-n",
            "help",
            "bash",
            "-ce",
            help_script().as_str(),
        ])?;
        runner::run(cancel, cmd).await
    }

    /// Opens a window running `command`, its output mirrored to the app's log.
    pub async fn start_app(
        &self,
        cancel: &CancellationToken,
        name: &str,
        command: &str,
    ) -> Result<()> {
        let target = format!("{}:", self.name);
        let script = app_script(command, &self.log_dir.join(format!("{name}.log")));
        let cmd = self.tmux([
            "new-window",
            "-d",
            "-n",
            name,
            "-t",
            target.as_str(),
            "bash",
            "-ce",
            script.as_str(),
        ])?;
        runner::run(cancel, cmd).await
    }

    pub async fn has_app(&self, cancel: &CancellationToken, name: &str) -> Result<bool> {
        let windows = self.list_windows(cancel, "#{window_name}").await?;
        Ok(windows.lines().any(|window| window == name))
    }

    /// Pids of the processes started directly in each window.
    pub async fn pane_pids(&self, cancel: &CancellationToken) -> Result<Vec<i32>> {
        let raw = self.list_windows(cancel, "#{pane_pid}").await?;
        parse_pids(&raw)
    }

    /// Hands the terminal over to the session until the user detaches.
    pub async fn attach(&self, cancel: &CancellationToken) -> Result<()> {
        let tty = runner::tty()?;
        let mut cmd = self.tmux(["attach-session", "-t", self.name.as_str()])?;
        cmd.stdin(Stdio::from(tty.try_clone()?))
            .stdout(Stdio::from(tty.try_clone()?))
            .stderr(Stdio::from(tty));
        runner::run(cancel, cmd).await
    }

    /// Terminates every process in the session.
    ///
    /// `kill-session` would send SIGHUP; apps are given SIGTERM instead and
    /// the session closes by itself once its last window is gone.
    pub async fn kill(&self, cancel: &CancellationToken, grace: Duration) -> Result<()> {
        if !self.exists(cancel).await? {
            debug!(session = %self.name, "No tmux session to stop");
            return Ok(());
        }
        let mut pids = Vec::new();
        for pane in self.pane_pids(cancel).await? {
            let members = runner::group_members(pane)?;
            if members.is_empty() {
                pids.push(pane);
            } else {
                pids.extend(members);
            }
        }
        pids.sort_unstable();
        pids.dedup();
        info!(session = %self.name, count = pids.len(), "Stopping tmux session");
        runner::kill(cancel, &pids, grace).await
    }

    async fn list_windows(&self, cancel: &CancellationToken, format: &str) -> Result<String> {
        let cmd = self.tmux(["list-windows", "-t", self.name.as_str(), "-F", format])?;
        runner::output(cancel, cmd).await
    }

    fn tmux<'a>(&self, args: impl IntoIterator<Item = &'a str>) -> Result<Command> {
        let mut cmd = self.tools.tmux()?;
        cmd.args(args);
        Ok(cmd)
    }
}

fn help_script() -> String {
    format!(
        "trap '' SIGINT SIGQUIT; echo {}\n{IDLE_LOOP}",
        shell_words::quote(HELP)
    )
}

fn app_script(command: &str, log: &Path) -> String {
    format!(
        "{command} 2>&1 | tee -a {}\n{IDLE_LOOP}",
        shell_words::quote(&log.to_string_lossy())
    )
}

fn parse_pids(raw: &str) -> Result<Vec<i32>> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            line.parse().map_err(|_| Error::Parse {
                what: "tmux pane pid".to_string(),
                reason: format!("{line:?} is not a pid"),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::lookup_path;

    #[test]
    fn parses_pane_pids() {
        assert_eq!(parse_pids("101\n202\n\n").unwrap(), vec![101, 202]);
        assert!(parse_pids("").unwrap().is_empty());
        assert!(matches!(parse_pids("101\nabc\n"), Err(Error::Parse { .. })));
    }

    #[test]
    fn app_script_tees_into_quoted_log() {
        let script = app_script("/opt/bin/node start", Path::new("/home/me/my env/logs/node.log"));
        assert_eq!(
            script,
            "/opt/bin/node start 2>&1 | tee -a '/home/me/my env/logs/node.log'\nwhile :; do read -sr; done"
        );
    }

    #[test]
    fn help_pane_ignores_interrupts() {
        let script = help_script();
        assert!(script.starts_with("trap '' SIGINT SIGQUIT; echo '"));
        assert!(script.ends_with(IDLE_LOOP));
    }

    #[tokio::test]
    async fn session_lifecycle() {
        let Some(tmux) = lookup_path("tmux") else {
            return;
        };
        let dir = tempfile::tempdir().unwrap();
        let name = format!("localnet-test-{}", std::process::id());
        let session = Session::new(Tools::resolve(None, Some(tmux)), &name, dir.path());
        let cancel = CancellationToken::new();

        assert!(!session.exists(&cancel).await.unwrap());
        session.init(&cancel).await.unwrap();
        session.init(&cancel).await.unwrap();
        session
            .start_app(&cancel, "sleeper", "sleep 30")
            .await
            .unwrap();
        assert!(session.has_app(&cancel, "sleeper").await.unwrap());
        assert!(!session.has_app(&cancel, "missing").await.unwrap());
        assert_eq!(session.pane_pids(&cancel).await.unwrap().len(), 2);

        session.kill(&cancel, Duration::from_secs(5)).await.unwrap();
        let mut gone = false;
        for _ in 0..50 {
            if !session.exists(&cancel).await.unwrap() {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(gone, "session survived kill");
    }
}
