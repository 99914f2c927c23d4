mod channel_ipc;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use tokio::signal::unix::{SignalKind, signal};
use tokio::time::{Duration, interval, sleep};

use repodrop_core::config::{self, Settings};
use repodrop_core::{ApiFactory, Coordinator, GitHubApi, GitHubApiConfig, RepositoryApi, run_log};

const CONFIG_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Time given to writers to flush `host-shutdown` before the process exits.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(200);

fn channel_socket_path(data_root: &Path) -> PathBuf {
    data_root.join("ipc").join("channel.sock")
}

fn file_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).ok().and_then(|m| m.modified().ok())
}

fn github_factory() -> ApiFactory {
    Arc::new(|settings: &Settings| {
        let api = GitHubApi::new(GitHubApiConfig {
            token: settings.github.token.clone(),
            api_base: settings.github.api_base.clone(),
        })?;
        let api: Arc<dyn RepositoryApi> = Arc::new(api);
        Ok(api)
    })
}

async fn shutdown_signal() {
    let mut term = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(event = "daemon.sigterm_unavailable", error = %e, "daemon.sigterm_unavailable");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    run_log::init_logging(true);

    let config_root = config::default_config_dir();
    let data_root = config::default_data_dir();
    let config_path = config::config_path(&config_root);

    let coordinator = Coordinator::new(github_factory(), Some(data_root.clone()));
    match config::load_settings(&config_root) {
        Ok(settings) => {
            coordinator.apply_settings(settings);
        }
        Err(e) => {
            tracing::warn!(
                event = "config.load_failed",
                error = %e,
                path = %config_path.display(),
                "config.load_failed"
            );
            coordinator.invalidate(e.to_string());
        }
    }
    let mut last_config_mtime = file_mtime(&config_path);

    let socket_path = channel_socket_path(&data_root);
    let server = channel_ipc::spawn_channel_ipc_server(socket_path.clone(), coordinator.clone())?;
    tracing::info!(
        event = "daemon.started",
        socket = %socket_path.display(),
        config_version = coordinator.version(),
        ready = coordinator.is_ready(),
        "daemon.started"
    );

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut tick = interval(CONFIG_POLL_INTERVAL);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = tick.tick() => {}
        }

        // Reload between syncs only; a running sync keeps its snapshot anyway.
        if coordinator.is_busy() {
            continue;
        }
        let config_mtime = file_mtime(&config_path);
        if config_mtime.is_none() || config_mtime == last_config_mtime {
            continue;
        }

        match config::load_settings(&config_root) {
            Ok(settings) => {
                last_config_mtime = config_mtime;
                let version = coordinator.apply_settings(settings);
                tracing::info!(
                    event = "config.reloaded",
                    path = %config_path.display(),
                    config_version = version,
                    ready = coordinator.is_ready(),
                    "config.reloaded"
                );
            }
            Err(e) => {
                tracing::warn!(
                    event = "config.reload_failed",
                    error = %e,
                    path = %config_path.display(),
                    "config.reload_failed"
                );
            }
        }
    }

    tracing::info!(event = "daemon.stopping", "daemon.stopping");
    coordinator.shutdown();
    sleep(SHUTDOWN_GRACE).await;
    server.shutdown().await;
    Ok(())
}
