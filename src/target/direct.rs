//! Runs apps as plain processes on the host.
//!
//! Every app joins one process group, anchored by an idle `sleep` so the group
//! outlives any single app. The group id is stored in the spec, which lets a
//! later invocation find and stop everything this one started.

use std::net::Ipv4Addr;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::app::{AppBase, AppTarget, Binary, Container, Deployment, Set, Target};
use crate::config::Config;
use crate::error::Result;
use crate::ip_pool::IpPool;
use crate::pipeline::{postprocess_app, preprocess_app};
use crate::runner;
use crate::spec::Spec;
use crate::target::{allocate_ip, foreground_container, HOST_NETWORK_IP};

pub struct Direct {
    config: Config,
    spec: Arc<Spec>,
    ip_pool: IpPool,
}

impl Direct {
    pub fn new(config: Config, spec: Arc<Spec>) -> Self {
        Self {
            ip_pool: IpPool::resume(config.network, spec.ips()),
            config,
            spec,
        }
    }

    /// Returns the group apps join, starting its anchor if needed.
    fn ensure_group(&self) -> Result<i32> {
        if let Some(pgid) = self.spec.pgid() {
            if runner::is_alive(pgid)? {
                return Ok(pgid);
            }
            warn!(pgid, "Recorded process group is gone, starting a new one");
        }
        let mut anchor = Command::new("sleep");
        anchor
            .arg("infinity")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        runner::join_group(&mut anchor, 0);
        let pgid = runner::spawn_detached(anchor)?;
        info!(pgid, "Started process group");
        self.spec.set_pgid(Some(pgid));
        Ok(pgid)
    }

    /// Starts `command` in the group with output appended to the app's log.
    fn start(&self, app: &AppBase, command: &str) -> Result<()> {
        let pgid = self.ensure_group()?;
        let log = self.config.log_path(&app.name);
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log)?;

        let script = format!(
            "exec {command} >> {} 2>&1",
            shell_words::quote(&log.to_string_lossy())
        );
        let mut cmd = Command::new("bash");
        cmd.args(["-ce", &script])
            .current_dir(self.config.app_dir.join(&app.name))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        runner::join_group(&mut cmd, pgid);
        let pid = runner::spawn_detached(cmd)?;
        info!(app = %app.name, pid, pgid, "Started");
        Ok(())
    }

    async fn deploy_app(
        &self,
        cancel: &CancellationToken,
        ip: Ipv4Addr,
        mut base: AppBase,
        command: impl FnOnce(&AppBase) -> Result<String>,
    ) -> Result<Deployment> {
        preprocess_app(cancel, ip, &self.config.app_dir, &mut base).await?;
        self.start(&base, &command(&base)?)?;
        postprocess_app(cancel, ip, &base).await?;
        Ok(Deployment::new(ip))
    }
}

#[async_trait]
impl AppTarget for Direct {
    async fn deploy_binary(&self, cancel: &CancellationToken, app: Binary) -> Result<Deployment> {
        let ip = if app.requires_ip {
            allocate_ip(&self.spec, &self.ip_pool, &app.base.name)?
        } else {
            Ipv4Addr::UNSPECIFIED
        };
        let path = app.path;
        self.deploy_app(cancel, ip, app.base, |base| {
            Ok(runner::shell_join(&path, &base.args))
        })
        .await
    }

    async fn deploy_container(
        &self,
        cancel: &CancellationToken,
        app: Container,
    ) -> Result<Deployment> {
        let Container { base, image, tag } = app;
        let tools = &self.config.tools;
        let env = &self.config.env_name;
        self.deploy_app(cancel, HOST_NETWORK_IP, base, |base| {
            let rendered = Container {
                base: base.clone(),
                image,
                tag,
            };
            foreground_container(tools, env, &rendered)
        })
        .await
    }
}

#[async_trait]
impl Target for Direct {
    async fn deploy(&self, cancel: &CancellationToken, set: &Set) -> Result<()> {
        self.ensure_group()?;
        set.deploy(cancel, self, &self.spec).await
    }

    async fn stop(&self, cancel: &CancellationToken) -> Result<()> {
        let Some(pgid) = self.spec.pgid() else {
            return Ok(());
        };
        let members = runner::group_members(pgid)?;
        info!(pgid, count = members.len(), "Stopping process group");
        runner::kill(cancel, &members, self.config.shutdown_grace).await?;
        self.spec.set_pgid(None);
        Ok(())
    }

    async fn destroy(&self, cancel: &CancellationToken) -> Result<()> {
        self.stop(cancel).await
    }
}
