//! Runs apps in windows of an interactive tmux session.

use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::app::{AppBase, AppTarget, Binary, Container, Deployment, Set, Target};
use crate::config::Config;
use crate::error::Result;
use crate::ip_pool::IpPool;
use crate::pipeline::{postprocess_app, preprocess_app};
use crate::runner;
use crate::session::Session;
use crate::spec::Spec;
use crate::target::{allocate_ip, foreground_container, HOST_NETWORK_IP};

pub struct Tmux {
    config: Config,
    spec: Arc<Spec>,
    ip_pool: IpPool,
    session: Mutex<Session>,
}

impl Tmux {
    pub fn new(config: Config, spec: Arc<Spec>) -> Self {
        let session = Session::new(
            config.tools.clone(),
            config.env_name.clone(),
            config.log_dir.clone(),
        );
        Self {
            ip_pool: IpPool::resume(config.network, spec.ips()),
            session: Mutex::new(session),
            config,
            spec,
        }
    }

    async fn add_app(&self, cancel: &CancellationToken, name: &str, command: &str) -> Result<()> {
        let session = self.session.lock().await;
        session.init(cancel).await?;
        session.start_app(cancel, name, command).await?;
        info!(app = name, session = session.name(), "Started in tmux window");
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
        let command = command(&base)?;
        self.add_app(cancel, &base.name, &command).await?;
        postprocess_app(cancel, ip, &base).await?;
        Ok(Deployment::new(ip))
    }
}

#[async_trait]
impl AppTarget for Tmux {
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
impl Target for Tmux {
    /// Deploys the set, then attaches the terminal unless in testing mode.
    async fn deploy(&self, cancel: &CancellationToken, set: &Set) -> Result<()> {
        set.deploy(cancel, self, &self.spec).await?;
        if self.config.testing_mode {
            return Ok(());
        }
        // Attaching blocks until the user detaches; publish state first.
        self.spec.save()?;
        let session = self.session.lock().await;
        session.attach(cancel).await
    }

    async fn stop(&self, cancel: &CancellationToken) -> Result<()> {
        let session = self.session.lock().await;
        session.kill(cancel, self.config.shutdown_grace).await
    }

    async fn destroy(&self, cancel: &CancellationToken) -> Result<()> {
        self.stop(cancel).await
    }
}
