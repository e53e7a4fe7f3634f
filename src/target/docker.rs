//! Runs apps as detached containers.
//!
//! Binaries are wrapped into an image built on the fly. Every container is
//! labelled with its environment and app name so `stop` and `destroy` can
//! find them again without consulting the spec.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use minijinja::context;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::app::{AppTarget, Binary, Container, Deployment, Set, Target};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::pipeline::{postprocess_app, preprocess_app, render_template};
use crate::runner;
use crate::spec::Spec;
use crate::target::container_name;

const DOCKERFILE: &str = "FROM {{ base_image }}
{% for path in copy %}
COPY {{ path }} {{ path }}
{% endfor %}
ENTRYPOINT [{{ entrypoint }}]
";

const IP_FORMAT: &str = "{{range.NetworkSettings.Networks}}{{.IPAddress}}{{end}}";

const ENV_LABEL: &str = "localnet.env";
const APP_LABEL: &str = "localnet.app";

pub struct Docker {
    config: Config,
    spec: Arc<Spec>,
}

impl Docker {
    pub fn new(config: Config, spec: Arc<Spec>) -> Self {
        Self { config, spec }
    }

    fn docker<'a>(&self, args: impl IntoIterator<Item = &'a str>) -> Result<Command> {
        let mut cmd = self.config.tools.container()?;
        cmd.args(args);
        Ok(cmd)
    }

    /// Starts a detached, labelled container and returns its address.
    async fn run_container(
        &self,
        cancel: &CancellationToken,
        app: &str,
        image: &str,
        options: &[String],
        args: &[String],
    ) -> Result<Ipv4Addr> {
        let name = container_name(&self.config.env_name, app);
        self.remove_stale(cancel, &name).await?;

        let env_label = format!("{ENV_LABEL}={}", self.config.env_name);
        let app_label = format!("{APP_LABEL}={app}");
        let mut run = self.docker([
            "run",
            "--name",
            name.as_str(),
            "-d",
            "--label",
            env_label.as_str(),
            "--label",
            app_label.as_str(),
        ])?;
        run.args(options).arg(image).args(args).stdout(Stdio::null());
        runner::run(cancel, run).await?;

        self.follow_logs(app, &name)?;

        let inspect = self.docker(["inspect", "-f", IP_FORMAT, name.as_str()])?;
        let ip = parse_ip(&runner::output(cancel, inspect).await?)?;
        info!(app, container = %name, %ip, "Container started");
        Ok(ip)
    }

    /// Removes a container left over from an earlier, stopped deployment.
    async fn remove_stale(&self, cancel: &CancellationToken, name: &str) -> Result<()> {
        let mut rm = self.docker(["rm", "-f", name])?;
        rm.stdout(Stdio::null()).stderr(Stdio::null());
        match runner::run(cancel, rm).await {
            Ok(()) | Err(Error::CommandFailed { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Copies the container's output into the app's log file in the background.
    fn follow_logs(&self, app: &str, name: &str) -> Result<()> {
        let runtime = self.config.tools.container_path()?;
        let script = follow_logs_script(runtime, name, &self.config.log_path(app));
        let mut cmd = Command::new("bash");
        cmd.args(["-ce", &script])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        runner::spawn_detached(cmd)?;
        Ok(())
    }

    async fn labelled(&self, cancel: &CancellationToken, all: bool) -> Result<Vec<String>> {
        let filter = format!("label={ENV_LABEL}={}", self.config.env_name);
        let flags = if all { "-aq" } else { "-q" };
        let ps = self.docker(["ps", flags, "--filter", filter.as_str()])?;
        let out = runner::output(cancel, ps).await?;
        Ok(out.split_whitespace().map(str::to_string).collect())
    }
}

#[async_trait]
impl AppTarget for Docker {
    async fn deploy_binary(&self, cancel: &CancellationToken, app: Binary) -> Result<Deployment> {
        let mut base = app.base;
        preprocess_app(cancel, Ipv4Addr::UNSPECIFIED, &self.config.app_dir, &mut base).await?;

        let app_dir = self.config.app_dir.join(&base.name);
        let mut copy = vec![app.path.clone(), app_dir];
        copy.extend(base.copy.iter().cloned());
        let dockerfile = render_dockerfile(&self.config.base_image, &copy, &app.path)?;
        debug!(app = %base.name, %dockerfile, "Rendered Dockerfile");

        let image = format!("{}:latest", base.name);
        let build = self.docker(["build", "--tag", image.as_str(), "-f-", "/"])?;
        runner::run_with_input(cancel, build, dockerfile.into_bytes()).await?;

        let ip = self
            .run_container(cancel, &base.name, &image, &[], &base.args)
            .await?;
        postprocess_app(cancel, ip, &base).await?;
        Ok(Deployment::new(ip))
    }

    async fn deploy_container(
        &self,
        cancel: &CancellationToken,
        app: Container,
    ) -> Result<Deployment> {
        let image = app.reference();
        let mut base = app.base;
        preprocess_app(cancel, Ipv4Addr::UNSPECIFIED, &self.config.app_dir, &mut base).await?;

        let app_dir = self.config.app_dir.join(&base.name);
        let volume = format!("{0}:{0}", app_dir.display());
        let ip = self
            .run_container(
                cancel,
                &base.name,
                &image,
                &["--volume".to_string(), volume],
                &base.args,
            )
            .await?;
        postprocess_app(cancel, ip, &base).await?;
        Ok(Deployment::new(ip))
    }
}

#[async_trait]
impl Target for Docker {
    async fn deploy(&self, cancel: &CancellationToken, set: &Set) -> Result<()> {
        set.deploy(cancel, self, &self.spec).await
    }

    async fn stop(&self, cancel: &CancellationToken) -> Result<()> {
        let ids = self.labelled(cancel, false).await?;
        if ids.is_empty() {
            return Ok(());
        }
        info!(count = ids.len(), "Stopping containers");
        let grace = self.config.shutdown_grace.as_secs().max(1).to_string();
        let mut stop = self.docker(["stop", "--time", grace.as_str()])?;
        stop.args(&ids).stdout(Stdio::null());
        runner::run(cancel, stop).await
    }

    async fn destroy(&self, cancel: &CancellationToken) -> Result<()> {
        let ids = self.labelled(cancel, true).await?;
        if ids.is_empty() {
            return Ok(());
        }
        info!(count = ids.len(), "Removing containers");
        let mut rm = self.docker(["rm", "-f"])?;
        rm.args(&ids).stdout(Stdio::null());
        runner::run(cancel, rm).await
    }
}

/// Dockerfile wrapping `entrypoint` and the `copy` paths into `base_image`.
fn render_dockerfile(base_image: &str, copy: &[PathBuf], entrypoint: &Path) -> Result<String> {
    let copy: Vec<String> = copy.iter().map(|path| path.display().to_string()).collect();
    let entrypoint = serde_json::to_string(&entrypoint.to_string_lossy())?;
    render_template(
        DOCKERFILE,
        context! {
            base_image => base_image,
            copy => copy,
            entrypoint => entrypoint,
        },
    )
}

/// Appends the container's output to `log` for as long as it runs.
fn follow_logs_script(runtime: &Path, name: &str, log: &Path) -> String {
    format!(
        "exec {} >> {} 2>&1",
        runner::shell_join(runtime, &["logs".to_string(), "-f".to_string(), name.to_string()]),
        shell_words::quote(&log.to_string_lossy())
    )
}

/// Parses `inspect` output; no address at all means the runtime assigned none.
fn parse_ip(raw: &str) -> Result<Ipv4Addr> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Ipv4Addr::UNSPECIFIED);
    }
    raw.parse().map_err(|_| Error::Parse {
        what: "container address".to_string(),
        reason: format!("{raw:?} is not an IPv4 address"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dockerfile_copies_paths_and_sets_entrypoint() {
        let dockerfile = render_dockerfile(
            "fedora:latest",
            &[PathBuf::from("/opt/bin/chaind"), PathBuf::from("/home/me/.localnet/dev/app/chain")],
            Path::new("/opt/bin/chaind"),
        )
        .unwrap();
        assert!(dockerfile.starts_with("FROM fedora:latest\n"));
        assert!(dockerfile.contains("COPY /opt/bin/chaind /opt/bin/chaind\n"));
        assert!(dockerfile.contains(
            "COPY /home/me/.localnet/dev/app/chain /home/me/.localnet/dev/app/chain\n"
        ));
        assert!(dockerfile.ends_with("ENTRYPOINT [\"/opt/bin/chaind\"]\n"));
    }

    #[test]
    fn dockerfile_without_copies() {
        let dockerfile =
            render_dockerfile("alpine:3", &[], Path::new("/usr/bin/relayer")).unwrap();
        assert!(!dockerfile.contains("COPY"));
        assert!(dockerfile.contains("ENTRYPOINT [\"/usr/bin/relayer\"]"));
    }

    #[test]
    fn container_logs_append_to_app_log() {
        let script = follow_logs_script(
            Path::new("/usr/bin/podman"),
            "dev-chain",
            Path::new("/home/me/.localnet/dev/logs/chain.log"),
        );
        assert_eq!(
            script,
            "exec /usr/bin/podman logs -f dev-chain >> /home/me/.localnet/dev/logs/chain.log 2>&1"
        );
    }

    #[test]
    fn parses_inspect_output() {
        assert_eq!(parse_ip("172.17.0.3\n").unwrap(), Ipv4Addr::new(172, 17, 0, 3));
        assert_eq!(parse_ip("\n").unwrap(), Ipv4Addr::UNSPECIFIED);
        assert!(matches!(parse_ip("<no value>"), Err(Error::Parse { .. })));
    }
}
