//! Application descriptors, sets, and the traits targets implement.
//!
//! An app knows *what* to run (a binary or a container image with its args,
//! files, prerequisites, and hooks). A target knows *how* to run it. `Set`
//! walks its apps in order and asks the target to deploy each one, recording
//! the outcome in the `Spec`.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::{Error, Result};
use crate::health::HealthCheck;
use crate::spec::Spec;

/// Runs after prerequisites are healthy and files are written, before start.
pub type PreHook =
    Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Runs once the target has started the app and knows its address.
pub type PostHook = Arc<
    dyn Fn(CancellationToken, Deployment) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync,
>;

/// Computes file content at deploy time.
pub type ContentFn = Arc<dyn Fn() -> anyhow::Result<Vec<u8>> + Send + Sync>;

/// A file materialized under the app's directory before start.
#[derive(Clone, Default)]
pub struct File {
    /// Relative to `<app_dir>/<name>`.
    pub path: PathBuf,
    pub content: Vec<u8>,
    /// Computes the content when `content` is empty.
    pub content_fn: Option<ContentFn>,
    /// Render `content` as a template before writing.
    pub preprocess: bool,
}

/// Apps that must be healthy before this one starts.
#[derive(Clone, Default)]
pub struct Prerequisites {
    pub timeout: Duration,
    pub dependencies: Vec<Arc<dyn HealthCheck>>,
}

/// Fields shared by binaries and containers.
#[derive(Clone, Default)]
pub struct AppBase {
    pub name: String,
    pub args: Vec<String>,
    pub files: Vec<File>,
    /// Paths staged into images built for this app.
    pub copy: Vec<PathBuf>,
    pub requires: Prerequisites,
    pub pre_hook: Option<PreHook>,
    pub post_hook: Option<PostHook>,
}

impl AppBase {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// An executable started from the local filesystem.
#[derive(Clone, Default)]
pub struct Binary {
    pub base: AppBase,
    pub path: PathBuf,
    pub requires_ip: bool,
}

/// A container started from an image.
#[derive(Clone, Default)]
pub struct Container {
    pub base: AppBase,
    pub image: String,
    pub tag: String,
}

impl Container {
    /// `image:tag`, defaulting the tag to `latest`.
    pub fn reference(&self) -> String {
        let tag = if self.tag.is_empty() { "latest" } else { &self.tag };
        format!("{}:{}", self.image, tag)
    }
}

/// Result of deploying one app.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deployment {
    /// `0.0.0.0` when the app was not given an address.
    pub ip: Ipv4Addr,
}

impl Deployment {
    pub fn new(ip: Ipv4Addr) -> Self {
        Self { ip }
    }

    pub fn without_ip() -> Self {
        Self {
            ip: Ipv4Addr::UNSPECIFIED,
        }
    }

    pub fn has_ip(&self) -> bool {
        !self.ip.is_unspecified()
    }
}

/// Something a `Set` can deploy.
#[async_trait]
pub trait App: Send + Sync {
    fn name(&self) -> &str;

    /// Type tag recorded in the spec; never changes for a given name.
    fn app_type(&self) -> &str;

    async fn deploy(&self, cancel: &CancellationToken, target: &dyn AppTarget)
        -> Result<Deployment>;
}

/// Per-app deployment capability of a target.
#[async_trait]
pub trait AppTarget: Send + Sync {
    async fn deploy_binary(&self, cancel: &CancellationToken, app: Binary) -> Result<Deployment>;

    async fn deploy_container(
        &self,
        cancel: &CancellationToken,
        app: Container,
    ) -> Result<Deployment>;
}

/// A backend that runs whole sets.
#[async_trait]
pub trait Target: AppTarget {
    async fn deploy(&self, cancel: &CancellationToken, set: &Set) -> Result<()>;

    /// Stops every app while keeping whatever state the backend holds.
    async fn stop(&self, cancel: &CancellationToken) -> Result<()>;

    /// Stops every app and removes backend state.
    async fn destroy(&self, cancel: &CancellationToken) -> Result<()>;
}

#[async_trait]
impl App for Binary {
    fn name(&self) -> &str {
        &self.base.name
    }

    fn app_type(&self) -> &str {
        "binary"
    }

    async fn deploy(
        &self,
        cancel: &CancellationToken,
        target: &dyn AppTarget,
    ) -> Result<Deployment> {
        target.deploy_binary(cancel, self.clone()).await
    }
}

#[async_trait]
impl App for Container {
    fn name(&self) -> &str {
        &self.base.name
    }

    fn app_type(&self) -> &str {
        "container"
    }

    async fn deploy(
        &self,
        cancel: &CancellationToken,
        target: &dyn AppTarget,
    ) -> Result<Deployment> {
        target.deploy_container(cancel, self.clone()).await
    }
}

/// An ordered list of apps deployed together.
#[derive(Clone, Default)]
pub struct Set {
    apps: Vec<Arc<dyn App>>,
}

impl Set {
    pub fn new(apps: Vec<Arc<dyn App>>) -> Self {
        Self { apps }
    }

    pub fn push(&mut self, app: Arc<dyn App>) {
        self.apps.push(app);
    }

    pub fn apps(&self) -> &[Arc<dyn App>] {
        &self.apps
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }

    /// Deploys every app not already running, in order, stopping at the first
    /// failure. Apps deployed before the failure stay recorded as running.
    ///
    /// A stopped app keeps its recorded address but publishes its endpoints
    /// and params again.
    pub async fn deploy(
        &self,
        cancel: &CancellationToken,
        target: &dyn AppTarget,
        spec: &Spec,
    ) -> Result<()> {
        for app in &self.apps {
            let description = spec.describe_app(app.app_type(), app.name());
            if description.is_running() {
                info!(app = app.name(), "Already running, skipping");
                continue;
            }
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            info!(app = app.name(), "Deploying");
            description.clear_published();
            let deployment = app.deploy(cancel, target).await?;
            if deployment.has_ip() {
                description.set_ip(deployment.ip);
            }
            description.set_running(true);
            info!(app = app.name(), ip = %deployment.ip, "Deployed");
        }
        Ok(())
    }
}
