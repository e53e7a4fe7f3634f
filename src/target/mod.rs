//! Deployment backends.

use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::app::{Container, Target};
use crate::config::Config;
use crate::error::Result;
use crate::ip_pool::IpPool;
use crate::runner;
use crate::spec::Spec;
use crate::tools::Tools;

pub mod direct;
pub mod docker;
pub mod tmux;

pub use direct::Direct;
pub use docker::Docker;
pub use tmux::Tmux;

/// Address of containers sharing the host network.
pub const HOST_NETWORK_IP: Ipv4Addr = Ipv4Addr::LOCALHOST;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum TargetKind {
    /// Windows of an interactive tmux session.
    Tmux,
    /// Containers managed by podman or docker.
    Docker,
    /// Plain processes in a shared process group.
    Direct,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Tmux => "tmux",
            TargetKind::Docker => "docker",
            TargetKind::Direct => "direct",
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds the target selected in `config`.
pub fn new(config: Config, spec: Arc<Spec>) -> Box<dyn Target> {
    match config.target {
        TargetKind::Tmux => Box::new(Tmux::new(config, spec)),
        TargetKind::Docker => Box::new(Docker::new(config, spec)),
        TargetKind::Direct => Box::new(Direct::new(config, spec)),
    }
}

/// Address for `app`: the one recorded by an earlier start, or the next free one.
pub(crate) fn allocate_ip(spec: &Spec, pool: &IpPool, app: &str) -> Result<Ipv4Addr> {
    match spec.app(app).and_then(|description| description.ip()) {
        Some(ip) => Ok(ip),
        None => pool.next(),
    }
}

/// Shell command running `app` in the foreground on the host network.
///
/// Used by targets that supervise the container client instead of the
/// container itself.
pub(crate) fn foreground_container(tools: &Tools, env: &str, app: &Container) -> Result<String> {
    let runtime = tools.container_path()?;
    let mut args = vec![
        "run".to_string(),
        "--rm".to_string(),
        "--network".to_string(),
        "host".to_string(),
        "--name".to_string(),
        container_name(env, &app.base.name),
        app.reference(),
    ];
    args.extend(app.base.args.iter().cloned());
    Ok(runner::shell_join(runtime, &args))
}

/// Container name of `app` within environment `env`.
pub(crate) fn container_name(env: &str, app: &str) -> String {
    format!("{env}-{app}")
}
