//! localnet command-line interface.
//!
//! Resolves the environment's configuration, loads its stored spec, and runs
//! one lifecycle command against the configured target. Ctrl-C and SIGTERM
//! cancel whatever is in flight; child processes are shut down gracefully.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{Parser, Subcommand};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use localnet::catalog::Catalog;
use localnet::config::{Config, GlobalArgs};
use localnet::logging::LoggingConfig;
use localnet::runner::{self, ProcessSignal};
use localnet::spec::Spec;
use localnet::{target, Error};

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "localnet",
    version,
    about = "Brings up sets of interdependent apps on this machine",
    styles = help_styles(),
    disable_help_subcommand = true
)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Deploy the set; apps that are already running are left alone.
    Start,
    /// Stop every app, keeping the environment's state.
    Stop,
    /// Stop every app and forget the environment's state.
    Destroy,
    /// Print the environment's spec as JSON.
    Spec,
    /// Follow the log of an app.
    Logs {
        /// Name of the app.
        app: String,
    },
    /// Open a shell with the environment's client wrappers on PATH.
    Shell,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    LoggingConfig::new(cli.global.verbose, cli.global.log_format).init();

    let config = Config::from_args(&cli.global)?;
    let cancel = CancellationToken::new();
    if matches!(cli.command, Commands::Shell) {
        // The interactive shell owns Ctrl-C.
        spawn_interrupt_sink();
    } else {
        spawn_signal_listener(cancel.clone());
    }

    let spec = Arc::new(Spec::load(
        config.spec_path(),
        config.target.as_str(),
        &config.set_name,
        &config.env_name,
    )?);

    match cli.command {
        Commands::Start => start(&cancel, &config, spec).await,
        Commands::Stop => {
            target::new(config.clone(), spec.clone())
                .stop(&cancel)
                .await?;
            spec.mark_stopped();
            spec.save()?;
            info!(env = %config.env_name, "Stopped");
            Ok(())
        }
        Commands::Destroy => {
            target::new(config.clone(), spec.clone())
                .destroy(&cancel)
                .await?;
            spec.reset()?;
            info!(env = %config.env_name, "Destroyed");
            Ok(())
        }
        Commands::Spec => {
            println!("{}", spec.to_json()?);
            Ok(())
        }
        Commands::Logs { app } => follow_log(&cancel, &config, &app).await,
        Commands::Shell => shell(&cancel, &config).await,
    }
}

async fn start(cancel: &CancellationToken, config: &Config, spec: Arc<Spec>) -> Result<()> {
    let catalog = Catalog::load(config, spec.clone())?;
    let set = catalog.set(&config.set_name)?;
    if set.is_empty() {
        warn!(set = %config.set_name, "Set has no apps");
    }
    let target = target::new(config.clone(), spec.clone());

    info!(
        env = %config.env_name,
        set = %config.set_name,
        target = %config.target,
        "Deploying"
    );
    let deployed = target.deploy(cancel, &set).await;
    // Apps deployed before a failure stay recorded so they can be stopped.
    spec.save().context("failed to save environment state")?;
    deployed?;
    info!(spec = %config.spec_path().display(), "Environment is up");
    Ok(())
}

async fn follow_log(cancel: &CancellationToken, config: &Config, app: &str) -> Result<()> {
    let log = config.log_path(app);
    let mut tail = Command::new("tail");
    tail.args(["-F", "-n", "+0"]).arg(&log);
    // Ctrl-C reaches tail too, so it may exit on its own before being cancelled.
    match runner::run_with_grace(cancel, tail, config.shutdown_grace).await {
        Ok(()) | Err(Error::Cancelled) => Ok(()),
        Err(_) if cancel.is_cancelled() => Ok(()),
        Err(err) => Err(err).with_context(|| format!("cannot follow {}", log.display())),
    }
}

async fn shell(cancel: &CancellationToken, config: &Config) -> Result<()> {
    let exe = std::env::current_exe().context("cannot locate localnet executable")?;
    write_script(
        &config.wrapper_dir.join("localnet"),
        &format!("exec {} \"$@\"", shell_words::quote(&exe.to_string_lossy())),
    )?;
    write_script(
        &config.wrapper_dir.join("logs"),
        &format!(
            "exec tail -F -n +0 {}/\"$1\".log",
            shell_words::quote(&config.log_dir.to_string_lossy())
        ),
    )?;

    let path = match std::env::var_os("PATH") {
        Some(path) => {
            let dirs = std::iter::once(config.wrapper_dir.clone()).chain(std::env::split_paths(&path));
            std::env::join_paths(dirs).context("cannot extend PATH")?
        }
        None => config.wrapper_dir.clone().into_os_string(),
    };
    let home = config.home_dir.parent().unwrap_or(&config.home_dir);

    let tty = runner::tty().context("no terminal to attach the shell to")?;
    let mut bash = Command::new("bash");
    bash.current_dir(&config.log_dir)
        .env("PATH", path)
        .env("PS1", format!("({}) \\w $ ", config.env_name))
        .env("LOCALNET_ENV", &config.env_name)
        .env("LOCALNET_SET", &config.set_name)
        .env("LOCALNET_HOME", home)
        .env("LOCALNET_TARGET", config.target.as_str())
        .env("LOCALNET_BIN_DIR", &config.bin_dir)
        .env("LOCALNET_NETWORK", config.network.to_string())
        .env("LOCALNET_CONFIG", &config.catalog)
        .stdin(tty.try_clone()?)
        .stdout(tty.try_clone()?)
        .stderr(tty);
    match runner::run_with_grace(cancel, bash, config.shutdown_grace).await {
        Ok(()) | Err(Error::CommandFailed { .. }) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn write_script(path: &Path, body: &str) -> Result<()> {
    std::fs::write(path, format!("#!/bin/bash\n{body}\n"))
        .with_context(|| format!("cannot write {}", path.display()))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    Ok(())
}

fn spawn_signal_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(err) => {
                warn!(error = %err, "Cannot listen for SIGTERM");
                return;
            }
        };
        let received = tokio::select! {
            _ = tokio::signal::ctrl_c() => ProcessSignal::SigInt,
            _ = sigterm.recv() => ProcessSignal::SigTerm,
        };
        info!(signal = received.label(), "Shutting down");
        cancel.cancel();
    });
}

fn spawn_interrupt_sink() {
    tokio::spawn(async {
        while tokio::signal::ctrl_c().await.is_ok() {}
    });
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
        .valid(Style::new().fg_color(Some(AnsiColor::Green.into())))
        .invalid(
            Style::new()
                .fg_color(Some(AnsiColor::Red.into()))
                .effects(Effects::BOLD),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_subcommands_with_global_flags() {
        let cli = Cli::parse_from(["localnet", "logs", "chain", "--env", "ci", "--testing"]);
        assert!(matches!(cli.command, Commands::Logs { ref app } if app == "chain"));
        assert_eq!(cli.global.env_name, "ci");
        assert!(cli.global.testing);

        let cli = Cli::parse_from(["localnet", "--target", "docker", "start"]);
        assert!(matches!(cli.command, Commands::Start));
        assert_eq!(cli.global.target, target::TargetKind::Docker);
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
