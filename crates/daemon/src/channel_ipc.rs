use std::path::PathBuf;

use tokio::net::UnixListener;
use tokio::sync::oneshot;
use tokio::time::{Duration, sleep};

use repodrop_core::Coordinator;
use repodrop_core::channel::unix::spawn_link;

pub struct ChannelIpcServerHandle {
    socket_path: PathBuf,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl ChannelIpcServerHandle {
    pub async fn shutdown(self) {
        let mut this = self;
        if let Some(tx) = this.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = this.task.take() {
            let _ = task.await;
        }
        let _ = std::fs::remove_file(&this.socket_path);
    }
}

impl Drop for ChannelIpcServerHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

/// Accepts UI contexts on `socket_path` and hands every connection to the
/// coordinator as an endpoint.
pub fn spawn_channel_ipc_server(
    socket_path: PathBuf,
    coordinator: Coordinator,
) -> std::io::Result<ChannelIpcServerHandle> {
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::remove_file(&socket_path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    let listener = UnixListener::bind(&socket_path)?;
    let handle_socket_path = socket_path.clone();

    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accept = listener.accept() => {
                    let (stream, _) = match accept {
                        Ok(x) => x,
                        Err(e) => {
                            tracing::warn!(
                                event = "channel.ipc_accept_failed",
                                error = %e,
                                path = %socket_path.display(),
                                "channel.ipc_accept_failed"
                            );
                            sleep(Duration::from_millis(200)).await;
                            continue;
                        }
                    };
                    coordinator.serve_link(spawn_link(stream));
                }
            }
        }
    });

    Ok(ChannelIpcServerHandle {
        socket_path: handle_socket_path,
        shutdown_tx: Some(shutdown_tx),
        task: Some(task),
    })
}
