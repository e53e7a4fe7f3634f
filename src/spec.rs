//! Durable description of a running environment.
//!
//! The spec records which target, set and environment it belongs to, plus a
//! description of every deployed app: its address, whether it is running, and
//! the endpoints and parameters it published. Targets and post-hooks update it
//! concurrently; the CLI persists it so later invocations (`stop`, `spec`)
//! see the same topology.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::net::Ipv4Addr;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

pub struct Spec {
    path: PathBuf,
    target: String,
    set: String,
    env: String,
    apps: Mutex<BTreeMap<String, Arc<AppDescription>>>,
    pgid: Mutex<Option<i32>>,
}

/// What is known about one deployed app.
#[derive(Debug)]
pub struct AppDescription {
    name: String,
    app_type: String,
    state: Mutex<AppState>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct AppState {
    ip: Option<Ipv4Addr>,
    running: bool,
    endpoints: BTreeMap<String, String>,
    params: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SpecFile {
    target: String,
    set: String,
    env: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pgid: Option<i32>,
    #[serde(default)]
    apps: BTreeMap<String, AppFile>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AppFile {
    #[serde(rename = "type")]
    app_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ip: Option<Ipv4Addr>,
    #[serde(default)]
    running: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    endpoints: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    params: BTreeMap<String, String>,
}

impl Spec {
    /// Creates an empty spec that will be saved to `path`.
    pub fn new(path: impl Into<PathBuf>, target: &str, set: &str, env: &str) -> Self {
        Self {
            path: path.into(),
            target: target.to_string(),
            set: set.to_string(),
            env: env.to_string(),
            apps: Mutex::new(BTreeMap::new()),
            pgid: Mutex::new(None),
        }
    }

    /// Loads the spec stored at `path`, or starts an empty one if there is none.
    ///
    /// A stored spec created for another target, set or environment is
    /// rejected, so one invocation cannot silently adopt another's state.
    pub fn load(path: impl Into<PathBuf>, target: &str, set: &str, env: &str) -> Result<Self> {
        let path = path.into();
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No stored spec, starting fresh");
                return Ok(Self::new(path, target, set, env));
            }
            Err(err) => return Err(err.into()),
        };
        let stored: SpecFile = serde_json::from_str(&raw)?;
        for (field, existing, requested) in [
            ("target", &stored.target, target),
            ("set", &stored.set, set),
            ("env", &stored.env, env),
        ] {
            if existing != requested {
                return Err(Error::SpecMismatch {
                    field,
                    stored: existing.clone(),
                    requested: requested.to_string(),
                });
            }
        }

        let apps = stored
            .apps
            .into_iter()
            .map(|(name, app)| {
                let description = AppDescription {
                    name: name.clone(),
                    app_type: app.app_type,
                    state: Mutex::new(AppState {
                        ip: app.ip,
                        running: app.running,
                        endpoints: app.endpoints,
                        params: app.params,
                    }),
                };
                (name, Arc::new(description))
            })
            .collect();
        Ok(Self {
            path,
            target: stored.target,
            set: stored.set,
            env: stored.env,
            apps: Mutex::new(apps),
            pgid: Mutex::new(stored.pgid),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn set(&self) -> &str {
        &self.set
    }

    pub fn env(&self) -> &str {
        &self.env
    }

    /// Returns the description of `name`, creating it on first use.
    ///
    /// # Panics
    ///
    /// If `name` was already described with a different type.
    pub fn describe_app(&self, app_type: &str, name: &str) -> Arc<AppDescription> {
        let mut apps = self.apps.lock();
        let description = apps
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(AppDescription {
                    name: name.to_string(),
                    app_type: app_type.to_string(),
                    state: Mutex::new(AppState::default()),
                })
            })
            .clone();
        assert_eq!(
            description.app_type, app_type,
            "app {name} is already described with another type"
        );
        description
    }

    /// Returns the description of `name`, if it was ever deployed.
    pub fn app(&self, name: &str) -> Option<Arc<AppDescription>> {
        self.apps.lock().get(name).cloned()
    }

    pub fn app_names(&self) -> Vec<String> {
        self.apps.lock().keys().cloned().collect()
    }

    /// Addresses recorded for any app, running or not.
    pub fn ips(&self) -> Vec<Ipv4Addr> {
        let apps: Vec<Arc<AppDescription>> = self.apps.lock().values().cloned().collect();
        apps.iter().filter_map(|app| app.ip()).collect()
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.app(name).is_some_and(|app| app.is_running())
    }

    /// Marks every app as not running, keeping addresses and endpoints.
    pub fn mark_stopped(&self) {
        let apps: Vec<Arc<AppDescription>> = self.apps.lock().values().cloned().collect();
        for app in apps {
            app.set_running(false);
        }
    }

    /// Process group holding every app started by the direct target.
    pub fn pgid(&self) -> Option<i32> {
        *self.pgid.lock()
    }

    pub fn set_pgid(&self, pgid: Option<i32>) {
        *self.pgid.lock() = pgid;
    }

    /// Renders the spec as pretty JSON with keys in a stable order.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.snapshot())?)
    }

    /// Writes the spec to its path, readable only by the owner.
    pub fn save(&self) -> Result<()> {
        let mut json = self.to_json()?;
        json.push('\n');
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&self.path)?;
        file.write_all(json.as_bytes())?;
        debug!(path = %self.path.display(), "Saved spec");
        Ok(())
    }

    /// Forgets every app and deletes the stored file.
    pub fn reset(&self) -> Result<()> {
        self.apps.lock().clear();
        self.set_pgid(None);
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn snapshot(&self) -> SpecFile {
        let apps: Vec<Arc<AppDescription>> = self.apps.lock().values().cloned().collect();
        SpecFile {
            target: self.target.clone(),
            set: self.set.clone(),
            env: self.env.clone(),
            pgid: self.pgid(),
            apps: apps
                .into_iter()
                .map(|app| {
                    let state = app.state.lock().clone();
                    let file = AppFile {
                        app_type: app.app_type.clone(),
                        ip: state.ip,
                        running: state.running,
                        endpoints: state.endpoints,
                        params: state.params,
                    };
                    (app.name.clone(), file)
                })
                .collect(),
        }
    }
}

impl AppDescription {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn app_type(&self) -> &str {
        &self.app_type
    }

    pub fn ip(&self) -> Option<Ipv4Addr> {
        self.state.lock().ip
    }

    pub fn set_ip(&self, ip: Ipv4Addr) {
        self.state.lock().ip = Some(ip);
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    pub fn set_running(&self, running: bool) {
        self.state.lock().running = running;
    }

    /// Publishes an endpoint address such as `10.0.0.1:26657`.
    ///
    /// # Panics
    ///
    /// If the endpoint is already registered with a different address.
    pub fn add_endpoint(&self, name: &str, address: impl Into<String>) {
        let address = address.into();
        let mut state = self.state.lock();
        insert_once(&mut state.endpoints, &self.name, "endpoint", name, address);
    }

    pub fn endpoint(&self, name: &str) -> Option<String> {
        self.state.lock().endpoints.get(name).cloned()
    }

    pub fn endpoints(&self) -> BTreeMap<String, String> {
        self.state.lock().endpoints.clone()
    }

    /// Publishes a parameter other apps may read.
    ///
    /// # Panics
    ///
    /// If the parameter is already registered with a different value.
    pub fn add_param(&self, name: &str, value: impl Into<String>) {
        let value = value.into();
        let mut state = self.state.lock();
        insert_once(&mut state.params, &self.name, "param", name, value);
    }

    pub fn param(&self, name: &str) -> Option<String> {
        self.state.lock().params.get(name).cloned()
    }

    pub fn params(&self) -> BTreeMap<String, String> {
        self.state.lock().params.clone()
    }

    /// Drops endpoints and params so a redeploy can publish them afresh.
    pub fn clear_published(&self) {
        let mut state = self.state.lock();
        state.endpoints.clear();
        state.params.clear();
    }
}

fn insert_once(
    map: &mut BTreeMap<String, String>,
    app: &str,
    kind: &str,
    key: &str,
    value: String,
) {
    match map.get(key) {
        Some(existing) if *existing == value => {}
        Some(existing) => panic!(
            "{kind} {key} of app {app} is already set to {existing:?}, refusing {value:?}"
        ),
        None => {
            map.insert(key.to_string(), value);
        }
    }
}
