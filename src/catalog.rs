//! Apps and sets declared in `localnet.toml`.
//!
//! Each catalog entry becomes a `ConfiguredApp`: a binary or container
//! descriptor plus a health probe, so later apps can wait on it, and a
//! post-hook that publishes endpoints, params and a client wrapper script.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures::FutureExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::app::{
    App, AppBase, AppTarget, Binary, Container, ContentFn, Deployment, File, PostHook, PreHook,
    Prerequisites, Set,
};
use crate::config::{load_catalog, AppConfig, CatalogFile, Config, FileConfig, HealthConfig};
use crate::error::{Error, Result};
use crate::health::{HealthCheck, ProbeError};
use crate::pipeline::{app_context, render_template};
use crate::runner;
use crate::spec::Spec;

/// Set deployed when none is named explicitly.
pub const DEFAULT_SET: &str = "default";

const DEFAULT_REQUIRES_TIMEOUT: Duration = Duration::from_secs(20);
const HTTP_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Every app in the catalog, ready to be grouped into sets.
pub struct Catalog {
    apps: Vec<Arc<ConfiguredApp>>,
    sets: BTreeMap<String, Vec<String>>,
}

enum AppKind {
    Binary(Binary),
    Container(Container),
}

/// A catalog entry bound to the environment it is deployed into.
pub struct ConfiguredApp {
    name: String,
    app_type: String,
    kind: AppKind,
    health: Option<HealthConfig>,
    spec: Arc<Spec>,
    http: reqwest::Client,
}

impl Catalog {
    /// Reads the catalog file named in `config`.
    pub fn load(config: &Config, spec: Arc<Spec>) -> anyhow::Result<Self> {
        let file = load_catalog(&config.catalog)?;
        Ok(Self::build(file, config, spec)?)
    }

    pub fn build(file: CatalogFile, config: &Config, spec: Arc<Spec>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_PROBE_TIMEOUT)
            .no_proxy()
            .build()
            .map_err(|err| Error::Config(format!("cannot build HTTP client: {err}")))?;
        let source_dir = config
            .catalog
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();

        let mut apps: Vec<Arc<ConfiguredApp>> = Vec::with_capacity(file.apps.len());
        for entry in file.apps {
            if apps.iter().any(|app| app.name == entry.name) {
                return Err(Error::Config(format!("app {} is declared twice", entry.name)));
            }
            let mut dependencies: Vec<Arc<dyn HealthCheck>> = Vec::new();
            for dependency in &entry.depends_on {
                let found = apps
                    .iter()
                    .find(|app| &app.name == dependency)
                    .ok_or_else(|| {
                        Error::Config(format!(
                            "app {} depends on {dependency}, which must be declared before it",
                            entry.name
                        ))
                    })?;
                dependencies.push(found.clone());
            }
            let app = ConfiguredApp::new(entry, dependencies, config, &source_dir, &spec, &http)?;
            apps.push(Arc::new(app));
        }

        for (set, members) in &file.sets {
            if let Some(unknown) = members
                .iter()
                .find(|member| !apps.iter().any(|app| &app.name == *member))
            {
                return Err(Error::Config(format!(
                    "set {set} refers to unknown app {unknown}"
                )));
            }
        }
        Ok(Self {
            apps,
            sets: file.sets,
        })
    }

    /// The apps of set `name` in deployment order.
    ///
    /// `default` means every app in declaration order unless the catalog
    /// defines it.
    pub fn set(&self, name: &str) -> Result<Set> {
        let members: Vec<&str> = match self.sets.get(name) {
            Some(members) => members.iter().map(String::as_str).collect(),
            None if name == DEFAULT_SET => self.apps.iter().map(|app| app.name.as_str()).collect(),
            None => return Err(Error::Config(format!("unknown set {name}"))),
        };
        let mut set = Set::default();
        for member in members {
            if let Some(app) = self.apps.iter().find(|app| app.name == member) {
                set.push(app.clone());
            }
        }
        Ok(set)
    }

    pub fn app(&self, name: &str) -> Option<Arc<ConfiguredApp>> {
        self.apps.iter().find(|app| app.name == name).cloned()
    }
}

impl ConfiguredApp {
    fn new(
        entry: AppConfig,
        dependencies: Vec<Arc<dyn HealthCheck>>,
        config: &Config,
        source_dir: &Path,
        spec: &Arc<Spec>,
        http: &reqwest::Client,
    ) -> Result<Self> {
        let name = entry.name.clone();
        let app_dir = config.app_dir.join(&name);
        let files = entry
            .files
            .iter()
            .map(|file| file_from_config(file, source_dir))
            .collect();
        let grace = config.shutdown_grace;
        let pre_hook = entry
            .pre
            .clone()
            .map(|script| shell_pre_hook(name.clone(), script, app_dir.clone(), grace));

        let mut base = AppBase {
            name: name.clone(),
            args: entry.args.clone(),
            files,
            copy: entry.copy.clone(),
            requires: Prerequisites {
                timeout: entry
                    .requires_timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(DEFAULT_REQUIRES_TIMEOUT),
                dependencies,
            },
            pre_hook,
            post_hook: None,
        };

        let (kind, default_type, program) = match (&entry.path, &entry.image) {
            (Some(path), None) => {
                let path = config.bin_dir.join(path);
                (None, "binary", Some(path))
            }
            (None, Some(image)) => {
                if entry.wrapper_args.is_some() {
                    return Err(Error::Config(format!(
                        "container app {name} cannot have wrapper_args"
                    )));
                }
                let container = Container {
                    base: AppBase::default(),
                    image: image.clone(),
                    tag: entry.tag.clone().unwrap_or_default(),
                };
                (Some(container), "container", None)
            }
            _ => {
                return Err(Error::Config(format!(
                    "app {name} needs exactly one of path or image"
                )))
            }
        };
        let app_type = entry
            .app_type
            .clone()
            .unwrap_or_else(|| default_type.to_string());

        let actions = PostActions {
            app_type: app_type.clone(),
            name: name.clone(),
            app_dir,
            endpoints: entry.endpoints.clone(),
            params: entry.params.clone(),
            wrapper: match (&program, &entry.wrapper_args) {
                (Some(program), Some(args)) => Some(Wrapper {
                    path: config.wrapper_dir.join(&name),
                    program: program.clone(),
                    args: args.clone(),
                }),
                _ => None,
            },
            post: entry.post.clone(),
            grace,
            spec: spec.clone(),
        };
        if !actions.is_empty() {
            base.post_hook = Some(actions.into_hook());
        }

        let kind = match (kind, program) {
            (Some(container), _) => AppKind::Container(Container { base, ..container }),
            (None, Some(path)) => AppKind::Binary(Binary {
                base,
                path,
                requires_ip: entry.requires_ip,
            }),
            (None, None) => unreachable!("every app is a binary or a container"),
        };

        Ok(Self {
            name,
            app_type,
            kind,
            health: entry.health,
            spec: spec.clone(),
            http: http.clone(),
        })
    }

    /// Address probes connect to: the recorded one, or loopback.
    fn probe_ip(&self) -> Ipv4Addr {
        self.spec
            .app(&self.name)
            .and_then(|app| app.ip())
            .unwrap_or(Ipv4Addr::LOCALHOST)
    }

    async fn probe_tcp(&self, cancel: &CancellationToken, port: u16) -> Result<(), ProbeError> {
        let ip = self.probe_ip();
        tokio::select! {
            _ = cancel.cancelled() => Err(ProbeError::fatal(Error::Cancelled)),
            connected = TcpStream::connect((ip, port)) => connected
                .map(drop)
                .with_context(|| format!("cannot connect to {ip}:{port}"))
                .map_err(ProbeError::Retryable),
        }
    }

    async fn probe_http(
        &self,
        cancel: &CancellationToken,
        port: u16,
        path: &str,
    ) -> Result<(), ProbeError> {
        let url = format!("http://{}:{port}{path}", self.probe_ip());
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(ProbeError::fatal(Error::Cancelled)),
            response = self.http.get(&url).send() => response
                .with_context(|| format!("request to {url} failed"))
                .map_err(ProbeError::Retryable)?,
        };
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status.is_client_error()
            && status != reqwest::StatusCode::REQUEST_TIMEOUT
            && status != reqwest::StatusCode::TOO_MANY_REQUESTS
        {
            Err(ProbeError::fatal(anyhow::anyhow!("{url} answered {status}")))
        } else {
            Err(ProbeError::retryable(anyhow::anyhow!("{url} answered {status}")))
        }
    }
}

#[async_trait]
impl App for ConfiguredApp {
    fn name(&self) -> &str {
        &self.name
    }

    fn app_type(&self) -> &str {
        &self.app_type
    }

    async fn deploy(
        &self,
        cancel: &CancellationToken,
        target: &dyn AppTarget,
    ) -> Result<Deployment> {
        match &self.kind {
            AppKind::Binary(binary) => target.deploy_binary(cancel, binary.clone()).await,
            AppKind::Container(container) => {
                target.deploy_container(cancel, container.clone()).await
            }
        }
    }
}

#[async_trait]
impl HealthCheck for ConfiguredApp {
    fn name(&self) -> &str {
        &self.name
    }

    async fn health_check(&self, cancel: &CancellationToken) -> Result<(), ProbeError> {
        match &self.health {
            Some(HealthConfig::Tcp(port)) => self.probe_tcp(cancel, *port).await,
            Some(HealthConfig::Http { port, path }) => self.probe_http(cancel, *port, path).await,
            None if self.spec.is_running(&self.name) => Ok(()),
            None => Err(ProbeError::retryable(anyhow::anyhow!(
                "{} is not running",
                self.name
            ))),
        }
    }
}

fn file_from_config(file: &FileConfig, source_dir: &Path) -> File {
    let content_fn = file.source.as_ref().map(|source| {
        let source = source_dir.join(source);
        let read: ContentFn = Arc::new(move || {
            std::fs::read(&source).with_context(|| format!("cannot read {}", source.display()))
        });
        read
    });
    File {
        path: file.path.clone(),
        content: file.content.clone().into_bytes(),
        content_fn,
        preprocess: file.preprocess,
    }
}

fn shell_pre_hook(name: String, script: String, dir: PathBuf, grace: Duration) -> PreHook {
    Arc::new(move |cancel: CancellationToken| {
        let name = name.clone();
        let script = script.clone();
        let dir = dir.clone();
        async move {
            run_shell(&cancel, &script, &dir, &[("LOCALNET_APP", name.as_str())], grace)
                .await
                .with_context(|| format!("pre command of {name} failed"))
        }
        .boxed()
    })
}

async fn run_shell(
    cancel: &CancellationToken,
    script: &str,
    dir: &Path,
    envs: &[(&str, &str)],
    grace: Duration,
) -> Result<()> {
    let mut cmd = Command::new("bash");
    cmd.args(["-ce", script]).current_dir(dir);
    for (key, value) in envs {
        cmd.env(key, value);
    }
    runner::run_with_grace(cancel, cmd, grace).await
}

struct Wrapper {
    path: PathBuf,
    program: PathBuf,
    args: Vec<String>,
}

/// What happens once an app has an address.
struct PostActions {
    app_type: String,
    name: String,
    app_dir: PathBuf,
    endpoints: BTreeMap<String, u16>,
    params: BTreeMap<String, String>,
    wrapper: Option<Wrapper>,
    post: Option<String>,
    grace: Duration,
    spec: Arc<Spec>,
}

impl PostActions {
    fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
            && self.params.is_empty()
            && self.wrapper.is_none()
            && self.post.is_none()
    }

    fn into_hook(self) -> PostHook {
        let actions = Arc::new(self);
        Arc::new(move |cancel: CancellationToken, deployment: Deployment| {
            let actions = actions.clone();
            async move { actions.run(&cancel, deployment).await }.boxed()
        })
    }

    async fn run(&self, cancel: &CancellationToken, deployment: Deployment) -> anyhow::Result<()> {
        // Apps without an address of their own are reached through loopback.
        let ip = if deployment.has_ip() {
            deployment.ip
        } else {
            Ipv4Addr::LOCALHOST
        };
        let description = self.spec.describe_app(&self.app_type, &self.name);
        for (endpoint, port) in &self.endpoints {
            description.add_endpoint(endpoint, format!("{ip}:{port}"));
        }
        for (param, value) in &self.params {
            description.add_param(param, value.clone());
        }

        let ctx = app_context(ip, &self.name, &self.app_dir);
        if let Some(wrapper) = &self.wrapper {
            let args = wrapper
                .args
                .iter()
                .map(|arg| render_template(arg, ctx.clone()))
                .collect::<Result<Vec<_>>>()?;
            write_wrapper(&wrapper.path, &runner::shell_join(&wrapper.program, &args))
                .await
                .with_context(|| format!("cannot write wrapper {}", wrapper.path.display()))?;
            debug!(app = %self.name, path = %wrapper.path.display(), "Wrote client wrapper");
        }

        if let Some(post) = &self.post {
            let script = render_template(post, ctx)?;
            let ip = ip.to_string();
            info!(app = %self.name, "Running post command");
            run_shell(
                cancel,
                &script,
                &self.app_dir,
                &[("LOCALNET_APP", self.name.as_str()), ("LOCALNET_IP", ip.as_str())],
                self.grace,
            )
            .await
            .with_context(|| format!("post command of {} failed", self.name))?;
        }
        Ok(())
    }
}

async fn write_wrapper(path: &Path, command: &str) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o700)
        .open(path)
        .await?;
    file.write_all(format!("#!/bin/bash\nexec {command} \"$@\"\n").as_bytes())
        .await?;
    file.flush().await
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    use super::*;
    use crate::target::TargetKind;
    use crate::tools::Tools;

    fn config(home: &Path) -> Config {
        let home_dir = home.join("dev");
        let config = Config {
            env_name: "dev".to_string(),
            set_name: DEFAULT_SET.to_string(),
            target: TargetKind::Direct,
            app_dir: home_dir.join("app"),
            log_dir: home_dir.join("logs"),
            wrapper_dir: home_dir.join("bin"),
            home_dir,
            bin_dir: PathBuf::from("/opt/bin"),
            network: Ipv4Addr::new(127, 1, 0, 0),
            testing_mode: true,
            verbose: false,
            shutdown_grace: Duration::from_secs(5),
            base_image: "fedora:latest".to_string(),
            catalog: home.join("localnet.toml"),
            tools: Tools::default(),
        };
        for dir in [&config.app_dir, &config.log_dir, &config.wrapper_dir] {
            std::fs::create_dir_all(dir).unwrap();
        }
        config
    }

    fn catalog(raw: &str, config: &Config) -> (Result<Catalog>, Arc<Spec>) {
        let spec = Arc::new(Spec::new(config.spec_path(), "direct", "dev", "dev"));
        let file: CatalogFile = toml::from_str(raw).unwrap();
        (Catalog::build(file, config, spec.clone()), spec)
    }

    fn names(set: &Set) -> Vec<&str> {
        set.apps().iter().map(|app| app.name()).collect()
    }

    const CHAIN_AND_RELAYER: &str = r#"
[sets]
chain-only = ["chain"]

[[app]]
name = "chain"
type = "chain"
path = "chaind"
requires_ip = true
endpoints = { rpc = 26657 }
params = { chain_id = "dev-1" }
wrapper_args = ["--node", "tcp://{{ ip }}:26657"]

[[app]]
name = "relayer"
image = "ghcr.io/acme/relayer"
depends_on = ["chain"]
"#;

    #[test]
    fn builds_named_and_default_sets() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let (catalog, _) = catalog(CHAIN_AND_RELAYER, &config);
        let catalog = catalog.unwrap();

        assert_eq!(names(&catalog.set("chain-only").unwrap()), vec!["chain"]);
        assert_eq!(names(&catalog.set(DEFAULT_SET).unwrap()), vec!["chain", "relayer"]);
        assert!(matches!(catalog.set("prod"), Err(Error::Config(_))));

        let chain = catalog.app("chain").unwrap();
        assert_eq!(chain.app_type(), "chain");
        match &chain.kind {
            AppKind::Binary(binary) => {
                assert_eq!(binary.path, PathBuf::from("/opt/bin/chaind"));
                assert!(binary.requires_ip);
                assert!(binary.base.post_hook.is_some());
                assert!(binary.base.pre_hook.is_none());
            }
            AppKind::Container(_) => panic!("chain should be a binary"),
        }

        let relayer = catalog.app("relayer").unwrap();
        assert_eq!(relayer.app_type(), "container");
        match &relayer.kind {
            AppKind::Container(container) => {
                assert_eq!(container.reference(), "ghcr.io/acme/relayer:latest");
                assert_eq!(container.base.requires.dependencies.len(), 1);
                assert_eq!(container.base.requires.dependencies[0].name(), "chain");
                assert_eq!(container.base.requires.timeout, DEFAULT_REQUIRES_TIMEOUT);
                assert!(container.base.post_hook.is_none());
            }
            AppKind::Binary(_) => panic!("relayer should be a container"),
        }
    }

    #[test]
    fn rejects_invalid_catalogs() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        for raw in [
            // dependency declared later
            "[[app]]\nname = \"a\"\npath = \"a\"\ndepends_on = [\"b\"]\n[[app]]\nname = \"b\"\npath = \"b\"\n",
            // duplicate name
            "[[app]]\nname = \"a\"\npath = \"a\"\n[[app]]\nname = \"a\"\npath = \"b\"\n",
            // neither path nor image
            "[[app]]\nname = \"a\"\n",
            // both path and image
            "[[app]]\nname = \"a\"\npath = \"a\"\nimage = \"a\"\n",
            // set with unknown member
            "[sets]\ndev = [\"ghost\"]\n[[app]]\nname = \"a\"\npath = \"a\"\n",
        ] {
            let (catalog, _) = catalog(raw, &config);
            assert!(matches!(catalog, Err(Error::Config(_))), "accepted {raw}");
        }
    }

    #[tokio::test]
    async fn post_hook_publishes_endpoints_and_wrapper() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let (catalog, spec) = catalog(CHAIN_AND_RELAYER, &config);
        let chain = catalog.unwrap().app("chain").unwrap();
        let AppKind::Binary(binary) = &chain.kind else {
            panic!("chain should be a binary");
        };
        spec.describe_app("chain", "chain");

        let hook = binary.base.post_hook.clone().unwrap();
        let deployment = Deployment::new(Ipv4Addr::new(127, 1, 0, 1));
        hook(CancellationToken::new(), deployment).await.unwrap();
        // Running the hook twice with the same address is harmless.
        hook(CancellationToken::new(), deployment).await.unwrap();

        let description = spec.app("chain").unwrap();
        assert_eq!(description.endpoint("rpc").as_deref(), Some("127.1.0.1:26657"));
        assert_eq!(description.param("chain_id").as_deref(), Some("dev-1"));

        let wrapper = config.wrapper_dir.join("chain");
        assert_eq!(
            std::fs::read_to_string(&wrapper).unwrap(),
            "#!/bin/bash\nexec /opt/bin/chaind --node 'tcp://127.1.0.1:26657' \"$@\"\n"
        );
        let mode = std::fs::metadata(&wrapper).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[tokio::test]
    async fn shell_hooks_run_in_app_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let raw = r#"
[[app]]
name = "node"
path = "node"
pre = "echo $LOCALNET_APP > pre.txt"
post = "echo {{ name }} $LOCALNET_IP > post.txt"
"#;
        let (catalog, spec) = catalog(raw, &config);
        let node = catalog.unwrap().app("node").unwrap();
        let AppKind::Binary(binary) = &node.kind else {
            panic!("node should be a binary");
        };
        spec.describe_app("binary", "node");
        let app_dir = config.app_dir.join("node");
        std::fs::create_dir_all(&app_dir).unwrap();

        let pre = binary.base.pre_hook.clone().unwrap();
        pre(CancellationToken::new()).await.unwrap();
        let post = binary.base.post_hook.clone().unwrap();
        post(CancellationToken::new(), Deployment::without_ip())
            .await
            .unwrap();

        assert_eq!(std::fs::read_to_string(app_dir.join("pre.txt")).unwrap(), "node\n");
        assert_eq!(
            std::fs::read_to_string(app_dir.join("post.txt")).unwrap(),
            "node 127.0.0.1\n"
        );
    }

    #[test]
    fn file_source_is_read_at_deploy_time() {
        let dir = tempfile::tempdir().unwrap();
        let file = FileConfig {
            path: PathBuf::from("genesis.json"),
            content: String::new(),
            source: Some(PathBuf::from("genesis.src.json")),
            preprocess: false,
        };
        let file = file_from_config(&file, dir.path());
        std::fs::write(dir.path().join("genesis.src.json"), "{}").unwrap();
        let read = file.content_fn.unwrap();
        assert_eq!(read().unwrap(), b"{}");
    }

    #[tokio::test]
    async fn tcp_probe_follows_listener() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let raw = format!("[[app]]\nname = \"chain\"\npath = \"chaind\"\nhealth = {{ tcp = {port} }}\n");
        let (catalog, spec) = catalog(&raw, &config);
        let chain = catalog.unwrap().app("chain").unwrap();
        spec.describe_app("binary", "chain")
            .set_ip(Ipv4Addr::LOCALHOST);

        let cancel = CancellationToken::new();
        chain.health_check(&cancel).await.unwrap();
        drop(listener);
        assert!(matches!(
            chain.health_check(&cancel).await,
            Err(ProbeError::Retryable(_))
        ));
    }

    /// Answers every request on the listener with `status`.
    async fn serve(listener: TcpListener, status: &'static str) {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let response =
                format!("HTTP/1.1 {status}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
            let _ = socket.write_all(response.as_bytes()).await;
        }
    }

    #[tokio::test]
    async fn http_probe_classifies_status() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let healthy = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let broken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let healthy_port = healthy.local_addr().unwrap().port();
        let broken_port = broken.local_addr().unwrap().port();
        tokio::spawn(serve(healthy, "200 OK"));
        tokio::spawn(serve(broken, "404 Not Found"));

        let raw = format!(
            "[[app]]\nname = \"api\"\npath = \"api\"\nhealth = {{ http = {{ port = {healthy_port}, path = \"/health\" }} }}\n\
             [[app]]\nname = \"web\"\npath = \"web\"\nhealth = {{ http = {{ port = {broken_port} }} }}\n"
        );
        let (catalog, _) = catalog(&raw, &config);
        let catalog = catalog.unwrap();
        let cancel = CancellationToken::new();

        catalog
            .app("api")
            .unwrap()
            .health_check(&cancel)
            .await
            .unwrap();
        assert!(matches!(
            catalog.app("web").unwrap().health_check(&cancel).await,
            Err(ProbeError::Fatal(_))
        ));
    }

    #[tokio::test]
    async fn app_without_probe_is_healthy_once_running() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let (catalog, spec) = catalog("[[app]]\nname = \"a\"\npath = \"a\"\n", &config);
        let app = catalog.unwrap().app("a").unwrap();
        let cancel = CancellationToken::new();

        assert!(app.health_check(&cancel).await.is_err());
        spec.describe_app("binary", "a").set_running(true);
        app.health_check(&cancel).await.unwrap();
    }
}
