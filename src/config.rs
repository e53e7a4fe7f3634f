//! Configuration for localnet.
//!
//! Runtime settings come from global command-line flags, each of which falls
//! back to a `LOCALNET_*` environment variable. Apps and sets are declared in
//! a `localnet.toml` catalog, whose file structure is defined here.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::logging::LogFormat;
use crate::target::TargetKind;
use crate::tools::Tools;

/// Flags shared by every subcommand.
#[derive(Debug, Clone, clap::Args)]
pub struct GlobalArgs {
    /// Name of the environment; also names the tmux session.
    #[arg(long = "env", env = "LOCALNET_ENV", default_value = "localnet", global = true)]
    pub env_name: String,
    /// Set of apps to deploy.
    #[arg(long = "set", env = "LOCALNET_SET", default_value = "default", global = true)]
    pub set_name: String,
    /// Where apps are deployed.
    #[arg(long, env = "LOCALNET_TARGET", value_enum, default_value_t = TargetKind::Tmux, global = true)]
    pub target: TargetKind,
    /// Root of all environments (default: ~/.localnet).
    #[arg(long, env = "LOCALNET_HOME", global = true)]
    pub home: Option<PathBuf>,
    /// Directory holding app binaries.
    #[arg(long, env = "LOCALNET_BIN_DIR", default_value = ".", global = true)]
    pub bin_dir: PathBuf,
    /// Network address apps get their IPs from.
    #[arg(long, env = "LOCALNET_NETWORK", default_value = "127.1.0.0", global = true)]
    pub network: Ipv4Addr,
    /// Path to the app catalog.
    #[arg(long, env = "LOCALNET_CONFIG", default_value = "localnet.toml", global = true)]
    pub config: PathBuf,
    /// Do not attach to the tmux session after deploying.
    #[arg(long, global = true)]
    pub testing: bool,
    /// Log at debug level.
    #[arg(short, long, global = true)]
    pub verbose: bool,
    /// Format of log records.
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty, global = true)]
    pub log_format: LogFormat,
    /// Time to wait after sending SIGTERM before killing (ms).
    #[arg(long, default_value_t = 20_000, global = true)]
    pub shutdown_grace_ms: u64,
    /// Base image binaries are wrapped into by the docker target.
    #[arg(long, default_value = "fedora:latest", global = true)]
    pub base_image: String,
    /// Container runtime executable (default: podman or docker from PATH).
    #[arg(long, env = "LOCALNET_CONTAINER_BIN", global = true)]
    pub container_bin: Option<PathBuf>,
    /// tmux executable (default: tmux from PATH).
    #[arg(long, env = "LOCALNET_TMUX_BIN", global = true)]
    pub tmux_bin: Option<PathBuf>,
}

/// Resolved settings of one environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub env_name: String,
    pub set_name: String,
    pub target: TargetKind,
    /// `<home>/<env>`
    pub home_dir: PathBuf,
    pub app_dir: PathBuf,
    pub log_dir: PathBuf,
    /// Client wrapper scripts written by apps.
    pub wrapper_dir: PathBuf,
    pub bin_dir: PathBuf,
    pub network: Ipv4Addr,
    pub testing_mode: bool,
    pub verbose: bool,
    pub shutdown_grace: Duration,
    pub base_image: String,
    pub catalog: PathBuf,
    pub tools: Tools,
}

impl Config {
    /// Resolves paths and creates the environment's directory tree.
    pub fn from_args(args: &GlobalArgs) -> Result<Self> {
        if args.env_name.is_empty() || args.env_name.contains('/') {
            return Err(Error::Config(format!(
                "environment name {:?} must be non-empty and contain no '/'",
                args.env_name
            )));
        }
        let home = match &args.home {
            Some(home) => absolute(home)?,
            None => dirs::home_dir()
                .ok_or_else(|| Error::Config("cannot determine home directory".to_string()))?
                .join(".localnet"),
        };
        let home_dir = home.join(&args.env_name);
        let config = Self {
            env_name: args.env_name.clone(),
            set_name: args.set_name.clone(),
            target: args.target,
            app_dir: home_dir.join("app"),
            log_dir: home_dir.join("logs"),
            wrapper_dir: home_dir.join("bin"),
            home_dir,
            bin_dir: absolute(&args.bin_dir)?,
            network: args.network,
            testing_mode: args.testing,
            verbose: args.verbose,
            shutdown_grace: Duration::from_millis(args.shutdown_grace_ms),
            base_image: args.base_image.clone(),
            catalog: absolute(&args.config)?,
            tools: Tools::resolve(args.container_bin.clone(), args.tmux_bin.clone()),
        };
        for dir in [&config.app_dir, &config.log_dir, &config.wrapper_dir] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(config)
    }

    pub fn spec_path(&self) -> PathBuf {
        self.home_dir.join("spec.json")
    }

    pub fn log_path(&self, app: &str) -> PathBuf {
        self.log_dir.join(format!("{app}.log"))
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

/// Top-level structure of `localnet.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogFile {
    /// Named sets; each lists app names in deployment order.
    #[serde(default)]
    pub sets: BTreeMap<String, Vec<String>>,
    #[serde(rename = "app", default)]
    pub apps: Vec<AppConfig>,
}

/// One app in the catalog.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    pub name: String,
    /// Type tag recorded in the spec (default: "binary" or "container").
    #[serde(rename = "type")]
    pub app_type: Option<String>,
    /// Executable, relative to the bin dir unless absolute.
    pub path: Option<String>,
    /// Image to run; makes this a container app.
    pub image: Option<String>,
    pub tag: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub requires_ip: bool,
    /// Apps that must be healthy first. They must appear earlier in the file.
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub requires_timeout_ms: Option<u64>,
    #[serde(default)]
    pub copy: Vec<PathBuf>,
    /// Shell command run before start.
    pub pre: Option<String>,
    /// Shell command run once the app has an address.
    pub post: Option<String>,
    /// Arguments baked into a client wrapper script.
    pub wrapper_args: Option<Vec<String>>,
    pub health: Option<HealthConfig>,
    /// Ports published as `<ip>:<port>` endpoints.
    #[serde(default)]
    pub endpoints: BTreeMap<String, u16>,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(rename = "file", default)]
    pub files: Vec<FileConfig>,
}

/// How to tell whether an app is ready.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthConfig {
    /// Accepts TCP connections on the port.
    Tcp(u16),
    /// Answers GET on the path with a success status.
    Http {
        port: u16,
        #[serde(default = "default_health_path")]
        path: String,
    },
}

fn default_health_path() -> String {
    "/".to_string()
}

/// A file written into the app's directory.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub path: PathBuf,
    #[serde(default)]
    pub content: String,
    /// Read content from this file at deploy time instead.
    pub source: Option<PathBuf>,
    #[serde(default)]
    pub preprocess: bool,
}

/// Loads and parses the catalog from a file path.
pub fn load_catalog(path: &Path) -> anyhow::Result<CatalogFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read catalog {}", path.display()))?;
    let catalog: CatalogFile = toml::from_str(&raw)
        .with_context(|| format!("failed to parse catalog {}", path.display()))?;
    Ok(catalog)
}
