//! External executables the targets drive.
//!
//! Tools are resolved once at startup and handed to the targets that need
//! them, so nothing consults `PATH` behind the caller's back.

use std::path::{Path, PathBuf};

use tokio::process::Command;

use crate::error::{Error, Result};

/// Container runtimes in order of preference.
const CONTAINER_RUNTIMES: [&str; 2] = ["podman", "docker"];

#[derive(Debug, Clone, Default)]
pub struct Tools {
    container: Option<PathBuf>,
    tmux: Option<PathBuf>,
}

impl Tools {
    /// Uses the explicit overrides when given, otherwise searches `PATH`.
    pub fn resolve(container: Option<PathBuf>, tmux: Option<PathBuf>) -> Self {
        Self {
            container: container
                .or_else(|| CONTAINER_RUNTIMES.iter().find_map(|name| lookup_path(name))),
            tmux: tmux.or_else(|| lookup_path("tmux")),
        }
    }

    /// A new command for the container runtime (podman or docker).
    pub fn container(&self) -> Result<Command> {
        self.container
            .as_deref()
            .map(Command::new)
            .ok_or(Error::ToolNotFound { tool: "docker" })
    }

    pub fn container_path(&self) -> Result<&Path> {
        self.container
            .as_deref()
            .ok_or(Error::ToolNotFound { tool: "docker" })
    }

    /// A new command for tmux.
    pub fn tmux(&self) -> Result<Command> {
        self.tmux
            .as_deref()
            .map(Command::new)
            .ok_or(Error::ToolNotFound { tool: "tmux" })
    }
}

/// Finds an executable named `name` in `PATH`.
pub fn lookup_path(name: &str) -> Option<PathBuf> {
    which::which(name).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_overrides_win() {
        let tools = Tools::resolve(
            Some(PathBuf::from("/opt/podman")),
            Some(PathBuf::from("/opt/tmux")),
        );
        assert_eq!(tools.container_path().unwrap(), Path::new("/opt/podman"));
        assert_eq!(
            tools.tmux().unwrap().as_std().get_program(),
            Path::new("/opt/tmux").as_os_str()
        );
    }

    #[test]
    fn missing_tools_are_reported_on_use() {
        let tools = Tools::default();
        assert!(matches!(
            tools.container(),
            Err(Error::ToolNotFound { tool: "docker" })
        ));
        assert!(matches!(tools.tmux(), Err(Error::ToolNotFound { tool: "tmux" })));
    }

    #[test]
    fn finds_shell_in_path() {
        assert!(lookup_path("sh").is_some());
        assert!(lookup_path("definitely-not-a-real-tool-name").is_none());
    }
}
