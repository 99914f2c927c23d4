//! The background side: owns the sync pipeline and every connected UI
//! endpoint, routes inbound messages, and fans progress out to all endpoints.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::channel::Link;
use crate::config::{Settings, validate_settings};
use crate::pipeline::{ProjectContext, SyncPipeline, SyncReport, new_run_id};
use crate::progress::{ProgressSink, UploadProgress};
use crate::protocol::{ArchiveReady, LogLevel, Message};
use crate::remote::RepositoryApi;
use crate::run_log::start_run_log;
use crate::{Error, Result};

/// Builds the remote client for a settings snapshot.
pub type ApiFactory = Arc<dyn Fn(&Settings) -> Result<Arc<dyn RepositoryApi>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EndpointId(u64);

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ep{}", self.0)
    }
}

struct State {
    version: u64,
    fingerprint: Option<String>,
    pipeline: Option<Arc<SyncPipeline>>,
    not_ready: String,
    pending_commit_message: Option<String>,
    endpoints: BTreeMap<EndpointId, mpsc::UnboundedSender<Message>>,
    next_endpoint: u64,
}

struct Inner {
    factory: ApiFactory,
    data_dir: Option<PathBuf>,
    state: Mutex<State>,
    busy: AtomicBool,
}

/// Explicitly constructed; clones share one instance.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    /// `data_dir` enables per-sync run logs under `<data_dir>/logs`.
    pub fn new(factory: ApiFactory, data_dir: Option<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Inner {
                factory,
                data_dir,
                state: Mutex::new(State {
                    version: 0,
                    fingerprint: None,
                    pipeline: None,
                    not_ready: "settings not loaded".to_string(),
                    pending_commit_message: None,
                    endpoints: BTreeMap::new(),
                    next_endpoint: 0,
                }),
                busy: AtomicBool::new(false),
            }),
        }
    }

    /// Current configuration version. Bumped on every effective change.
    pub fn version(&self) -> u64 {
        self.lock().version
    }

    pub fn is_ready(&self) -> bool {
        self.lock().pipeline.is_some()
    }

    pub fn is_busy(&self) -> bool {
        self.inner.busy.load(Ordering::SeqCst)
    }

    pub fn endpoint_count(&self) -> usize {
        self.lock().endpoints.len()
    }

    pub fn pending_commit_message(&self) -> Option<String> {
        self.lock().pending_commit_message.clone()
    }

    /// Rebuilds the pipeline when `settings` differ from the last applied
    /// ones, and tells every endpoint. Invalid settings clear the pipeline.
    /// A sync already running keeps the pipeline it started with.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn apply_settings(&self, settings: Settings) -> u64 {
        let fingerprint = settings.fingerprint();
        if self.lock().fingerprint.as_deref() == Some(fingerprint.as_str()) {
            return self.version();
        }

        let built = validate_settings(&settings)
            .and_then(|()| settings.check_ready())
            .and_then(|()| (self.inner.factory)(&settings));
        let (version, ready) = {
            let mut st = self.lock();
            st.version += 1;
            st.fingerprint = Some(fingerprint);
            match built {
                Ok(api) => {
                    st.pipeline = Some(Arc::new(SyncPipeline::new(api, settings)));
                    st.not_ready.clear();
                }
                Err(e) => {
                    warn!(event = "settings.not_ready", error = %e, "settings.not_ready");
                    st.pipeline = None;
                    st.not_ready = e.to_string();
                }
            }
            (st.version, st.pipeline.is_some())
        };

        info!(event = "settings.applied", version, ready, "settings.applied");
        self.broadcast(&Message::SettingsChanged { version, ready });
        version
    }

    /// Drops the pipeline, e.g. when the config file can no longer be read.
    pub fn invalidate(&self, reason: impl Into<String>) -> u64 {
        let version = {
            let mut st = self.lock();
            st.version += 1;
            st.fingerprint = None;
            st.pipeline = None;
            st.not_ready = reason.into();
            st.version
        };
        self.broadcast(&Message::SettingsChanged {
            version,
            ready: false,
        });
        version
    }

    pub fn attach(&self, outbound: mpsc::UnboundedSender<Message>) -> EndpointId {
        let mut st = self.lock();
        st.next_endpoint += 1;
        let id = EndpointId(st.next_endpoint);
        st.endpoints.insert(id, outbound);
        debug!(event = "endpoint.attached", endpoint = %id, "endpoint.attached");
        id
    }

    pub fn detach(&self, id: EndpointId) {
        if self.lock().endpoints.remove(&id).is_some() {
            debug!(event = "endpoint.detached", endpoint = %id, "endpoint.detached");
        }
    }

    /// Attaches the host side of `link` and handles its inbound messages
    /// until the link closes; the endpoint is detached then.
    pub fn serve_link(&self, link: Link) -> JoinHandle<()> {
        let Link {
            outbound,
            mut inbound,
        } = link;
        let id = self.attach(outbound);
        let this = self.clone();
        tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                this.handle_message(id, message);
            }
            this.detach(id);
        })
    }

    pub fn handle_message(&self, from: EndpointId, message: Message) {
        match message {
            Message::ArchiveReady(request) => {
                if let Err(e) = self.start_sync(request) {
                    warn!(
                        event = "sync.rejected",
                        endpoint = %from,
                        code = e.code(),
                        error = %e,
                        "sync.rejected"
                    );
                    self.send_to(from, Message::rejected(&e));
                }
            }
            Message::SetCommitMessage { message } => {
                let message = message.trim();
                self.lock().pending_commit_message =
                    (!message.is_empty()).then(|| message.to_string());
            }
            Message::ContentScriptReady => {
                let (version, ready) = {
                    let st = self.lock();
                    (st.version, st.pipeline.is_some())
                };
                self.send_to(from, Message::SettingsChanged { version, ready });
            }
            Message::DebugLog { level, message } => match level {
                LogLevel::Debug => debug!(event = "ui.log", endpoint = %from, text = %message, "ui.log"),
                LogLevel::Info => info!(event = "ui.log", endpoint = %from, text = %message, "ui.log"),
                LogLevel::Warn => warn!(event = "ui.log", endpoint = %from, text = %message, "ui.log"),
                LogLevel::Error => error!(event = "ui.log", endpoint = %from, text = %message, "ui.log"),
            },
            other => {
                warn!(
                    event = "endpoint.unexpected_message",
                    endpoint = %from,
                    kind = other.kind(),
                    "endpoint.unexpected_message"
                );
            }
        }
    }

    /// Starts a sync in the background. Rejects immediately when not ready,
    /// when the request was made against an outdated configuration, or when
    /// another sync is still running.
    pub fn start_sync(&self, request: ArchiveReady) -> Result<JoinHandle<Result<SyncReport>>> {
        let pipeline = {
            let st = self.lock();
            let Some(pipeline) = st.pipeline.clone() else {
                return Err(Error::NotReady {
                    message: st.not_ready.clone(),
                });
            };
            if let Some(seen) = request.config_version
                && seen != st.version
            {
                return Err(Error::StaleConfig {
                    seen,
                    current: st.version,
                });
            }
            pipeline
        };
        let archive = request.decode()?;

        if self
            .inner
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::Busy);
        }
        let busy = BusyGuard(self.inner.clone());

        let commit_message = request
            .commit_message
            .filter(|m| !m.trim().is_empty())
            .or_else(|| self.lock().pending_commit_message.take());
        let project = ProjectContext {
            project_id: request.project_id,
        };
        let sink: Arc<dyn ProgressSink> = Arc::new(BroadcastSink(self.inner.clone()));
        let data_dir = self.inner.data_dir.clone();

        Ok(tokio::spawn(async move {
            let _busy = busy;
            let run_id = new_run_id();
            let _log = data_dir.as_deref().and_then(|dir| {
                start_run_log(&run_id, dir)
                    .map_err(|e| {
                        warn!(event = "run_log.start_failed", error = %e, "run_log.start_failed");
                    })
                    .ok()
            });
            pipeline
                .process_run(run_id, archive, &project, commit_message.as_deref(), sink)
                .await
        }))
    }

    /// Tells every endpoint the host is going away and forgets them.
    pub fn shutdown(&self) {
        let endpoints = std::mem::take(&mut self.lock().endpoints);
        for tx in endpoints.values() {
            let _ = tx.send(Message::HostShutdown);
        }
        info!(
            event = "coordinator.shutdown",
            endpoints = endpoints.len() as u64,
            "coordinator.shutdown"
        );
    }

    pub fn broadcast(&self, message: &Message) {
        broadcast(&self.inner, message);
    }

    fn send_to(&self, id: EndpointId, message: Message) {
        let mut st = self.lock();
        let closed = match st.endpoints.get(&id) {
            Some(tx) => tx.send(message).is_err(),
            None => false,
        };
        if closed {
            st.endpoints.remove(&id);
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        lock_state(&self.inner)
    }
}

fn lock_state(inner: &Inner) -> MutexGuard<'_, State> {
    inner.state.lock().unwrap_or_else(|e| e.into_inner())
}

/// Sends to every endpoint, dropping the ones whose transport is gone.
fn broadcast(inner: &Inner, message: &Message) {
    let mut st = lock_state(inner);
    st.endpoints.retain(|id, tx| {
        let open = tx.send(message.clone()).is_ok();
        if !open {
            debug!(event = "endpoint.detached", endpoint = %id, "endpoint.detached");
        }
        open
    });
}

struct BroadcastSink(Arc<Inner>);

impl ProgressSink for BroadcastSink {
    fn on_progress(&self, progress: UploadProgress) {
        broadcast(&self.0, &Message::UploadStatus(progress));
    }
}

struct BusyGuard(Arc<Inner>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.busy.store(false, Ordering::SeqCst);
    }
}
