use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::archive::{self, Entries};
use crate::config::{MAX_ARCHIVE_BYTES, Settings};
use crate::ignore_filter;
use crate::progress::{ProgressSink, SyncPhase, UploadProgress, upload_percent};
use crate::rate_limit::{RateLimitSignal, RateLimiter};
use crate::remote::{PutFileRequest, RepositoryApi, encode_content};
use crate::task_queue::TaskQueue;
use crate::{Error, Result};

/// Where one sync writes to. Fixed for the duration of the sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncTarget {
    pub owner: String,
    pub repo: String,
    pub branch: String,
}

impl SyncTarget {
    /// Default target from settings, overridden field by field by the
    /// project's entry when the sync names a known project.
    pub fn resolve(settings: &Settings, project: &ProjectContext) -> Result<Self> {
        let mut target = Self {
            owner: settings.github.owner.trim().to_string(),
            repo: settings.github.repo.trim().to_string(),
            branch: settings.github.branch.trim().to_string(),
        };

        if let Some(p) = project
            .project_id
            .as_deref()
            .and_then(|id| settings.projects.get(id))
        {
            if let Some(owner) = p.owner.as_deref().filter(|s| !s.trim().is_empty()) {
                target.owner = owner.trim().to_string();
            }
            if !p.repo.trim().is_empty() {
                target.repo = p.repo.trim().to_string();
            }
            if let Some(branch) = p.branch.as_deref().filter(|s| !s.trim().is_empty()) {
                target.branch = branch.trim().to_string();
            }
        }

        if target.owner.is_empty() {
            return Err(Error::MissingConfiguration { field: "owner" });
        }
        if target.repo.is_empty() {
            return Err(Error::MissingConfiguration { field: "repo" });
        }
        if target.branch.is_empty() {
            target.branch = crate::config::DEFAULT_BRANCH.to_string();
        }
        Ok(target)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectContext {
    pub project_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub run_id: String,
    pub target: SyncTarget,
    pub files_uploaded: u64,
    pub files_skipped: u64,
    pub duration: Duration,
}

/// Turns one archive into per-file commits on the target branch.
///
/// Owns the limiter and the single-slot upload queue; both live as long as the
/// pipeline, so syncs run through one pipeline share one quota window.
pub struct SyncPipeline {
    api: Arc<dyn RepositoryApi>,
    settings: Settings,
    limiter: Arc<RateLimiter>,
    queue: TaskQueue,
    run_seq: Arc<AtomicU64>,
}

impl SyncPipeline {
    /// Must be called from within a Tokio runtime.
    pub fn new(api: Arc<dyn RepositoryApi>, settings: Settings) -> Self {
        let limiter = Arc::new(RateLimiter::new(settings.rate_limit.clone()));
        Self {
            api,
            settings,
            limiter,
            queue: TaskQueue::new(1),
            run_seq: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Runs one sync. Every outcome is also reported to `sink`: a terminal
    /// `success` or `error` event, then `idle` once the reset delay passes
    /// without another sync starting.
    ///
    /// Files committed before a failure stay committed.
    pub async fn process(
        &self,
        archive: Vec<u8>,
        project: &ProjectContext,
        commit_message: Option<&str>,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<SyncReport> {
        self.process_run(new_run_id(), archive, project, commit_message, sink)
            .await
    }

    /// [`process`](Self::process) under a caller-chosen run id.
    pub async fn process_run(
        &self,
        run_id: String,
        archive: Vec<u8>,
        project: &ProjectContext,
        commit_message: Option<&str>,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<SyncReport> {
        let seq = self.run_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let message = commit_message
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(&self.settings.sync.default_commit_message)
            .to_string();
        let timeout = self.settings.sync.timeout();
        let started = Instant::now();

        info!(
            event = "sync.start",
            run_id = %run_id,
            provider = self.api.provider(),
            archive_bytes = archive.len() as u64,
            project_id = project.project_id.as_deref().unwrap_or(""),
            "sync.start"
        );

        let work = self.run(&run_id, archive, project, &message, sink.as_ref());
        let result = match tokio::time::timeout(timeout, work).await {
            Ok(r) => r,
            Err(_) => {
                self.queue.cancel_pending();
                Err(Error::UploadTimeout { after: timeout })
            }
        };

        match &result {
            Ok(report) => {
                info!(
                    event = "sync.finish",
                    run_id = %run_id,
                    status = "success",
                    files_uploaded = report.files_uploaded,
                    files_skipped = report.files_skipped,
                    duration_ms = report.duration.as_millis() as u64,
                    "sync.finish"
                );
            }
            Err(e) => {
                error!(
                    event = "sync.finish",
                    run_id = %run_id,
                    status = "error",
                    category = e.category().as_str(),
                    duration_ms = started.elapsed().as_millis() as u64,
                    error = %e,
                    "sync.finish"
                );
                sink.on_progress(UploadProgress::new(SyncPhase::Error, 100, e.user_message()));
            }
        }

        self.schedule_idle(seq, sink);
        result
    }

    async fn run(
        &self,
        run_id: &str,
        archive: Vec<u8>,
        project: &ProjectContext,
        message: &str,
        sink: &dyn ProgressSink,
    ) -> Result<SyncReport> {
        let started = Instant::now();
        self.limiter.reset_retry_counter();
        self.limiter.reset_burst_counter();

        let limit = self.settings.sync.max_archive_bytes.min(MAX_ARCHIVE_BYTES);
        if archive.len() as u64 > limit {
            return Err(Error::ArchiveTooLarge {
                size: archive.len(),
                limit: limit as usize,
            });
        }
        sink.on_progress(UploadProgress::new(SyncPhase::Queued, 0, "Queued"));

        sink.on_progress(UploadProgress::new(
            SyncPhase::Extracting,
            5,
            "Extracting archive",
        ));
        let entries = tokio::task::spawn_blocking(move || archive::extract(&archive))
            .await
            .map_err(|e| Error::CorruptArchive {
                message: format!("extraction task failed: {e}"),
            })??;

        let target = SyncTarget::resolve(&self.settings, project)?;

        sink.on_progress(UploadProgress::new(
            SyncPhase::Validating,
            10,
            format!("Checking access to {}/{}", target.owner, target.repo),
        ));
        self.validate_repository(&target).await?;

        sink.on_progress(UploadProgress::new(
            SyncPhase::BranchCheck,
            15,
            format!("Preparing branch {}", target.branch),
        ));
        self.ensure_branch(&target).await?;

        let files = ignore_filter::filter(&entries);
        let files_skipped = entries.len().saturating_sub(files.len()) as u64;
        let total = files.len() as u64;
        debug!(
            event = "sync.files_selected",
            run_id,
            total,
            skipped = files_skipped,
            "sync.files_selected"
        );

        self.check_quota().await?;

        sink.on_progress(
            UploadProgress::new(
                SyncPhase::Uploading,
                upload_percent(0, total),
                format!("Uploading {total} files"),
            )
            .with_files(0, total),
        );
        let uploaded = self.upload_all(run_id, &target, files, message, sink).await?;

        sink.on_progress(
            UploadProgress::new(
                SyncPhase::Success,
                100,
                format!(
                    "Uploaded {uploaded} files to {}/{}@{}",
                    target.owner, target.repo, target.branch
                ),
            )
            .with_files(uploaded, total),
        );

        Ok(SyncReport {
            run_id: run_id.to_string(),
            target,
            files_uploaded: uploaded,
            files_skipped,
            duration: started.elapsed(),
        })
    }

    /// A branch listing needs push-capable access on private repositories,
    /// so it doubles as the permission probe.
    async fn validate_repository(&self, target: &SyncTarget) -> Result<()> {
        let api = self.api.as_ref();
        self.limiter
            .call(|| api.list_branches(&target.owner, &target.repo))
            .await
            .map_err(|e| access_error(e, target))?;
        Ok(())
    }

    async fn ensure_branch(&self, target: &SyncTarget) -> Result<()> {
        let api = self.api.as_ref();
        let (owner, repo, branch) = (&target.owner, &target.repo, &target.branch);

        if self
            .limiter
            .call(|| api.get_branch(owner, repo, branch))
            .await?
            .is_some()
        {
            return Ok(());
        }

        let info = self
            .limiter
            .call(|| api.get_repository(owner, repo))
            .await
            .map_err(|e| access_error(e, target))?;
        let base = self
            .limiter
            .call(|| api.get_branch(owner, repo, &info.default_branch))
            .await?
            .ok_or_else(|| Error::BranchCreationFailed {
                branch: branch.clone(),
                message: format!("default branch {} has no commits", info.default_branch),
            })?;

        self.limiter
            .call(|| api.create_branch(owner, repo, branch, &base.head_sha))
            .await
            .map_err(|e| match e {
                Error::RemoteApi {
                    status: 401 | 403,
                    message,
                } => Error::InsufficientPermissions { message },
                e @ (Error::RateLimitExhausted { .. } | Error::Network { .. }) => e,
                e => Error::BranchCreationFailed {
                    branch: branch.clone(),
                    message: e.to_string(),
                },
            })?;

        info!(
            event = "sync.branch_created",
            branch = %branch,
            from = %info.default_branch,
            "sync.branch_created"
        );
        Ok(())
    }

    /// An exhausted core quota is fed to the limiter as a throttling signal
    /// lasting until the quota window resets.
    async fn check_quota(&self) -> Result<()> {
        let status = match self.api.rate_limit_status().await {
            Ok(s) => s,
            Err(e) => {
                warn!(event = "sync.quota_unknown", error = %e, "sync.quota_unknown");
                return Ok(());
            }
        };
        if status.remaining > 0 {
            return Ok(());
        }

        let now = chrono::Utc::now().timestamp().max(0) as u64;
        let signal = RateLimitSignal {
            status: 403,
            retry_after: Some(Duration::from_secs(status.reset_at.saturating_sub(now))),
        };
        self.limiter.handle_rate_limit_signal(&signal).await
    }

    async fn upload_all(
        &self,
        run_id: &str,
        target: &SyncTarget,
        files: Entries,
        message: &str,
        sink: &dyn ProgressSink,
    ) -> Result<u64> {
        let total = files.len() as u64;
        let batch_size = u64::from(self.settings.sync.batch_size.max(1));
        // Tripped by the first failed file; queued files see it before their
        // first request. Also tripped when this future is dropped on timeout.
        let abort = CancellationToken::new();
        let _abort_on_drop = abort.clone().drop_guard();

        let handles: Vec<_> = files
            .into_iter()
            .map(|(path, content)| {
                let api = self.api.clone();
                let limiter = self.limiter.clone();
                let request = PutFileRequest {
                    owner: target.owner.clone(),
                    repo: target.repo.clone(),
                    path: path.clone(),
                    branch: target.branch.clone(),
                    message: message.to_string(),
                    content_base64: encode_content(&content),
                    sha: None,
                    author: self.settings.author.clone(),
                };
                let abort = abort.clone();
                let handle = self.queue.enqueue(async move {
                    if abort.is_cancelled() {
                        return Err(Error::Cancelled);
                    }
                    let res = upload_one(api.as_ref(), &limiter, request).await;
                    if res.is_err() {
                        abort.cancel();
                    }
                    res
                });
                (path, handle)
            })
            .collect();

        let mut done = 0u64;
        for (path, handle) in handles {
            if let Err(e) = handle.await {
                self.queue.cancel_pending();
                warn!(
                    event = "sync.file_failed",
                    run_id,
                    path = %path,
                    error = %e,
                    "sync.file_failed"
                );
                return Err(e);
            }

            done += 1;
            self.limiter.reset_retry_counter();
            if done % batch_size == 0 {
                self.limiter.reset_burst_counter();
            }
            debug!(event = "sync.file_uploaded", run_id, path = %path, done, total, "sync.file_uploaded");
            sink.on_progress(
                UploadProgress::new(
                    SyncPhase::Uploading,
                    upload_percent(done, total),
                    format!("Uploaded {path}"),
                )
                .with_files(done, total),
            );
        }
        Ok(done)
    }

    fn schedule_idle(&self, seq: u64, sink: Arc<dyn ProgressSink>) {
        let delay = self.settings.sync.idle_reset_delay();
        let run_seq = self.run_seq.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if run_seq.load(Ordering::SeqCst) == seq {
                sink.on_progress(UploadProgress::idle());
            }
        });
    }
}

pub fn new_run_id() -> String {
    format!("sync_{}", uuid::Uuid::new_v4().simple())
}

/// Create-or-update of one file. The current blob sha is looked up right
/// before the write so existing files are replaced rather than rejected.
async fn upload_one(
    api: &dyn RepositoryApi,
    limiter: &RateLimiter,
    mut request: PutFileRequest,
) -> Result<()> {
    let existing = limiter
        .call(|| api.get_file(&request.owner, &request.repo, &request.path, &request.branch))
        .await?;
    request.sha = existing.map(|f| f.sha);

    let request = &request;
    limiter.call(|| api.put_file(request)).await
}

fn access_error(err: Error, target: &SyncTarget) -> Error {
    match err {
        Error::RemoteApi { status: 404, .. } => Error::RepositoryNotFound {
            owner: target.owner.clone(),
            repo: target.repo.clone(),
        },
        Error::RemoteApi {
            status: 403,
            message,
        } => Error::InsufficientPermissions { message },
        e => e,
    }
}
