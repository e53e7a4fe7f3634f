//! Steps every target runs around starting an app.
//!
//! `preprocess_app` prepares an app for start: resolves lazy file content,
//! waits for prerequisites, renders templates with the app's address, writes
//! files, and runs the pre-hook. `postprocess_app` hands the deployment to
//! the post-hook once the target has started the app.

use std::net::Ipv4Addr;
use std::path::Path;

use minijinja::{context, Environment, UndefinedBehavior, Value};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::app::{AppBase, Deployment};
use crate::error::{Error, Result};
use crate::health::wait_until_healthy;

/// Renders `source` with strict undefined-variable checking.
pub fn render_template(source: &str, ctx: Value) -> Result<String> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.set_keep_trailing_newline(true);
    Ok(env.render_str(source, ctx)?)
}

/// Variables available to an app's args and preprocessed files.
pub fn app_context(ip: Ipv4Addr, name: &str, app_dir: &Path) -> Value {
    context! {
        ip => ip.to_string(),
        name => name,
        app_dir => app_dir.display().to_string(),
    }
}

pub async fn preprocess_app(
    cancel: &CancellationToken,
    ip: Ipv4Addr,
    app_dir: &Path,
    app: &mut AppBase,
) -> Result<()> {
    for file in app.files.iter_mut().filter(|file| file.content.is_empty()) {
        if let Some(content_fn) = &file.content_fn {
            file.content = content_fn().map_err(Error::Hook)?;
        }
    }

    if !app.requires.dependencies.is_empty() {
        info!(
            app = %app.name,
            count = app.requires.dependencies.len(),
            "Waiting for prerequisites"
        );
        wait_until_healthy(cancel, app.requires.timeout, &app.requires.dependencies).await?;
    }

    let dir = app_dir.join(&app.name);
    let ctx = app_context(ip, &app.name, &dir);
    app.args = app
        .args
        .iter()
        .map(|arg| render_template(arg, ctx.clone()))
        .collect::<Result<_>>()?;
    for file in app.files.iter_mut().filter(|file| file.preprocess) {
        let source = std::str::from_utf8(&file.content).map_err(|err| Error::Parse {
            what: format!("template {}", file.path.display()),
            reason: err.to_string(),
        })?;
        file.content = render_template(source, ctx.clone())?.into_bytes();
    }

    tokio::fs::create_dir_all(&dir).await?;
    for file in &app.files {
        let path = dir.join(&file.path);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut out = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)
            .await?;
        out.write_all(&file.content).await?;
        out.flush().await?;
        debug!(app = %app.name, path = %path.display(), "Wrote file");
    }

    if let Some(hook) = &app.pre_hook {
        debug!(app = %app.name, "Running pre-hook");
        hook(cancel.clone()).await.map_err(Error::Hook)?;
    }
    Ok(())
}

pub async fn postprocess_app(
    cancel: &CancellationToken,
    ip: Ipv4Addr,
    app: &AppBase,
) -> Result<()> {
    if let Some(hook) = &app.post_hook {
        debug!(app = %app.name, %ip, "Running post-hook");
        hook(cancel.clone(), Deployment::new(ip))
            .await
            .map_err(Error::Hook)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::anyhow;
    use async_trait::async_trait;
    use futures::FutureExt;
    use parking_lot::Mutex;

    use super::*;
    use crate::app::File;
    use crate::health::{HealthCheck, ProbeError};

    struct NeverHealthy;

    #[async_trait]
    impl HealthCheck for NeverHealthy {
        fn name(&self) -> &str {
            "chain"
        }

        async fn health_check(&self, _cancel: &CancellationToken) -> Result<(), ProbeError> {
            Err(ProbeError::retryable(anyhow!("connection refused")))
        }
    }

    fn file(path: &str, content: &str, preprocess: bool) -> File {
        File {
            path: PathBuf::from(path),
            content: content.as_bytes().to_vec(),
            content_fn: None,
            preprocess,
        }
    }

    #[tokio::test]
    async fn renders_args_and_writes_private_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut app = AppBase::new("node");
        app.args = vec!["--listen".to_string(), "{{ ip }}:26657".to_string()];
        app.files = vec![
            file("config/node.toml", "moniker = \"{{ name }}\"\nhome = \"{{ app_dir }}\"\n", true),
            file("raw.txt", "{{ untouched }}", false),
            File {
                path: PathBuf::from("generated"),
                content_fn: Some(Arc::new(|| Ok::<_, anyhow::Error>(b"computed".to_vec()))),
                ..File::default()
            },
        ];

        preprocess_app(
            &CancellationToken::new(),
            Ipv4Addr::new(127, 1, 0, 3),
            dir.path(),
            &mut app,
        )
        .await
        .unwrap();

        assert_eq!(app.args, vec!["--listen", "127.1.0.3:26657"]);
        let home = dir.path().join("node");
        let config = std::fs::read_to_string(home.join("config/node.toml")).unwrap();
        assert_eq!(
            config,
            format!("moniker = \"node\"\nhome = \"{}\"\n", home.display())
        );
        assert_eq!(
            std::fs::read_to_string(home.join("raw.txt")).unwrap(),
            "{{ untouched }}"
        );
        assert_eq!(std::fs::read(home.join("generated")).unwrap(), b"computed");
        let mode = std::fs::metadata(home.join("raw.txt"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn literal_content_wins_over_content_fn() {
        let dir = tempfile::tempdir().unwrap();
        let mut app = AppBase::new("node");
        app.files = vec![File {
            content_fn: Some(Arc::new(|| {
                Err::<Vec<u8>, _>(anyhow!("content_fn must not run"))
            })),
            ..file("genesis.json", "{\"chain_id\":\"dev-1\"}", false)
        }];

        preprocess_app(
            &CancellationToken::new(),
            Ipv4Addr::UNSPECIFIED,
            dir.path(),
            &mut app,
        )
        .await
        .unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("node/genesis.json")).unwrap(),
            "{\"chain_id\":\"dev-1\"}"
        );
    }

    #[tokio::test]
    async fn undefined_template_variable_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut app = AppBase::new("node");
        app.args = vec!["{{ port }}".to_string()];
        let err = preprocess_app(
            &CancellationToken::new(),
            Ipv4Addr::UNSPECIFIED,
            dir.path(),
            &mut app,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Template(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn unhealthy_prerequisite_blocks_start() {
        let dir = tempfile::tempdir().unwrap();
        let hook_ran = Arc::new(Mutex::new(false));
        let mut app = AppBase::new("relayer");
        app.requires.timeout = Duration::from_secs(3);
        app.requires.dependencies = vec![Arc::new(NeverHealthy)];
        let flag = hook_ran.clone();
        app.pre_hook = Some(Arc::new(move |_cancel: CancellationToken| {
            let flag = flag.clone();
            async move {
                *flag.lock() = true;
                Ok::<(), anyhow::Error>(())
            }
            .boxed()
        }));

        let err = preprocess_app(
            &CancellationToken::new(),
            Ipv4Addr::UNSPECIFIED,
            dir.path(),
            &mut app,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::DependencyUnavailable { ref name, .. } if name == "chain"));
        assert!(!*hook_ran.lock());
        assert!(!dir.path().join("relayer").exists());
    }

    #[tokio::test]
    async fn hooks_see_files_and_deployment() {
        let dir = tempfile::tempdir().unwrap();
        let seen = Arc::new(Mutex::new(None));
        let mut app = AppBase::new("node");
        app.files = vec![file("genesis.json", "{}", false)];
        let genesis = dir.path().join("node/genesis.json");
        app.pre_hook = Some(Arc::new(move |_cancel: CancellationToken| {
            let genesis = genesis.clone();
            async move {
                anyhow::ensure!(genesis.exists(), "genesis missing");
                Ok::<(), anyhow::Error>(())
            }
            .boxed()
        }));
        let record = seen.clone();
        app.post_hook = Some(Arc::new(
            move |_cancel: CancellationToken, deployment: Deployment| {
                *record.lock() = Some(deployment);
                async { Ok::<(), anyhow::Error>(()) }.boxed()
            },
        ));

        let ip = Ipv4Addr::new(10, 0, 0, 9);
        preprocess_app(&CancellationToken::new(), ip, dir.path(), &mut app)
            .await
            .unwrap();
        postprocess_app(&CancellationToken::new(), ip, &app)
            .await
            .unwrap();
        assert_eq!(*seen.lock(), Some(Deployment::new(ip)));
    }

    #[tokio::test]
    async fn hook_errors_propagate_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let mut app = AppBase::new("node");
        app.pre_hook = Some(Arc::new(|_cancel: CancellationToken| {
            async { Err::<(), _>(anyhow!("keyring locked")) }.boxed()
        }));
        let err = preprocess_app(
            &CancellationToken::new(),
            Ipv4Addr::UNSPECIFIED,
            dir.path(),
            &mut app,
        )
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "keyring locked");
    }

    #[test]
    fn render_keeps_trailing_newline() {
        let out = render_template("ip={{ ip }}\n", context! { ip => "1.2.3.4" }).unwrap();
        assert_eq!(out, "ip=1.2.3.4\n");
    }
}
