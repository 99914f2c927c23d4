use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

use base64::Engine;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue, RETRY_AFTER, USER_AGENT};
use reqwest::{Method, Url};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::Author;
use crate::{Error, Result};

pub type ApiFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryInfo {
    pub default_branch: String,
    pub can_push: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchInfo {
    pub name: String,
    pub head_sha: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub sha: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitStatus {
    pub limit: u64,
    pub remaining: u64,
    /// Unix seconds at which the quota window resets.
    pub reset_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutFileRequest {
    pub owner: String,
    pub repo: String,
    pub path: String,
    pub branch: String,
    pub message: String,
    pub content_base64: String,
    /// Blob sha of the file being replaced; `None` creates a new file.
    pub sha: Option<String>,
    pub author: Author,
}

/// The subset of a remote repository host the sync pipeline talks to.
pub trait RepositoryApi: Send + Sync {
    fn provider(&self) -> &'static str;

    fn get_repository<'a>(&'a self, owner: &'a str, repo: &'a str) -> ApiFuture<'a, RepositoryInfo>;

    fn list_branches<'a>(&'a self, owner: &'a str, repo: &'a str) -> ApiFuture<'a, Vec<BranchInfo>>;

    fn get_branch<'a>(
        &'a self,
        owner: &'a str,
        repo: &'a str,
        branch: &'a str,
    ) -> ApiFuture<'a, Option<BranchInfo>>;

    fn create_branch<'a>(
        &'a self,
        owner: &'a str,
        repo: &'a str,
        branch: &'a str,
        from_sha: &'a str,
    ) -> ApiFuture<'a, ()>;

    fn get_file<'a>(
        &'a self,
        owner: &'a str,
        repo: &'a str,
        path: &'a str,
        branch: &'a str,
    ) -> ApiFuture<'a, Option<RemoteFile>>;

    fn put_file<'a>(&'a self, request: &'a PutFileRequest) -> ApiFuture<'a, ()>;

    fn rate_limit_status(&self) -> ApiFuture<'_, RateLimitStatus>;
}

pub fn encode_content(text: &str) -> String {
    base64::engine::general_purpose::STANDARD.encode(text.as_bytes())
}

#[derive(Debug, Clone)]
pub struct GitHubApiConfig {
    pub token: String,
    pub api_base: String,
}

/// GitHub REST v3 client.
pub struct GitHubApi {
    base: Url,
    client: reqwest::Client,
}

impl GitHubApi {
    pub fn new(config: GitHubApiConfig) -> Result<Self> {
        let base = Url::parse(&config.api_base).map_err(|e| Error::InvalidConfig {
            message: format!("github.api_base invalid: {e}"),
        })?;

        let mut headers = HeaderMap::new();
        let auth = HeaderValue::from_str(&format!("Bearer {}", config.token.trim())).map_err(
            |_| Error::InvalidConfig {
                message: "github token contains invalid characters".to_string(),
            },
        )?;
        headers.insert(AUTHORIZATION, auth);
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
        headers.insert(
            "X-GitHub-Api-Version",
            HeaderValue::from_static("2022-11-28"),
        );
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("repodrop/", env!("CARGO_PKG_VERSION"))),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| Error::InvalidConfig {
                message: format!("http client build failed: {e}"),
            })?;

        Ok(Self { base, client })
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        {
            let mut path = url.path_segments_mut().map_err(|_| Error::InvalidConfig {
                message: "github.api_base cannot be a base url".to_string(),
            })?;
            path.pop_if_empty();
            for segment in segments {
                path.extend(segment.split('/').filter(|s| !s.is_empty()));
            }
        }
        Ok(url)
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        query: &[(&str, &str)],
        body: Option<serde_json::Value>,
    ) -> Result<(u16, String)> {
        let mut req = self.client.request(method.clone(), url.clone()).query(query);
        if let Some(body) = body {
            req = req.json(&body);
        }

        let res = req.send().await.map_err(|e| Error::Network {
            message: format!("{method} {} failed: {e}", url.path()),
        })?;
        let status = res.status().as_u16();
        let headers = res.headers().clone();
        let text = res.text().await.map_err(|e| Error::Network {
            message: format!("read response failed: {e}"),
        })?;

        if (200..300).contains(&status) {
            return Ok((status, text));
        }
        Err(error_from_response(status, &headers, &text))
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        url: Url,
        query: &[(&str, &str)],
    ) -> Result<T> {
        let (status, body) = self.send(Method::GET, url, query, None).await?;
        serde_json::from_str(&body).map_err(|e| Error::RemoteApi {
            status,
            message: format!("invalid json: {e}"),
        })
    }
}

impl RepositoryApi for GitHubApi {
    fn provider(&self) -> &'static str {
        "github"
    }

    fn get_repository<'a>(&'a self, owner: &'a str, repo: &'a str) -> ApiFuture<'a, RepositoryInfo> {
        Box::pin(async move {
            let url = self.url(&["repos", owner, repo])?;
            let parsed: GhRepository = self.get_json(url, &[]).await?;
            Ok(RepositoryInfo {
                default_branch: parsed.default_branch,
                can_push: parsed.permissions.map(|p| p.push),
            })
        })
    }

    fn list_branches<'a>(&'a self, owner: &'a str, repo: &'a str) -> ApiFuture<'a, Vec<BranchInfo>> {
        Box::pin(async move {
            let url = self.url(&["repos", owner, repo, "branches"])?;
            let parsed: Vec<GhBranch> = self.get_json(url, &[("per_page", "100")]).await?;
            Ok(parsed.into_iter().map(BranchInfo::from).collect())
        })
    }

    fn get_branch<'a>(
        &'a self,
        owner: &'a str,
        repo: &'a str,
        branch: &'a str,
    ) -> ApiFuture<'a, Option<BranchInfo>> {
        Box::pin(async move {
            let url = self.url(&["repos", owner, repo, "branches", branch])?;
            match self.get_json::<GhBranch>(url, &[]).await {
                Ok(b) => Ok(Some(b.into())),
                Err(Error::RemoteApi { status: 404, .. }) => Ok(None),
                Err(e) => Err(e),
            }
        })
    }

    fn create_branch<'a>(
        &'a self,
        owner: &'a str,
        repo: &'a str,
        branch: &'a str,
        from_sha: &'a str,
    ) -> ApiFuture<'a, ()> {
        Box::pin(async move {
            let url = self.url(&["repos", owner, repo, "git", "refs"])?;
            let body = serde_json::json!({
                "ref": format!("refs/heads/{branch}"),
                "sha": from_sha,
            });
            self.send(Method::POST, url, &[], Some(body)).await?;
            Ok(())
        })
    }

    fn get_file<'a>(
        &'a self,
        owner: &'a str,
        repo: &'a str,
        path: &'a str,
        branch: &'a str,
    ) -> ApiFuture<'a, Option<RemoteFile>> {
        Box::pin(async move {
            let url = self.url(&["repos", owner, repo, "contents", path])?;
            match self
                .get_json::<serde_json::Value>(url, &[("ref", branch)])
                .await
            {
                Ok(v) => Ok(v
                    .get("sha")
                    .and_then(|s| s.as_str())
                    .map(|sha| RemoteFile {
                        sha: sha.to_string(),
                    })),
                Err(Error::RemoteApi { status: 404, .. }) => Ok(None),
                Err(e) => Err(e),
            }
        })
    }

    fn put_file<'a>(&'a self, request: &'a PutFileRequest) -> ApiFuture<'a, ()> {
        Box::pin(async move {
            let url = self.url(&["repos", &request.owner, &request.repo, "contents", &request.path])?;
            let identity = serde_json::json!({
                "name": request.author.name,
                "email": request.author.email,
            });
            let mut body = serde_json::json!({
                "message": request.message,
                "content": request.content_base64,
                "branch": request.branch,
                "author": identity,
                "committer": identity,
            });
            if let Some(sha) = &request.sha {
                body["sha"] = serde_json::Value::String(sha.clone());
            }
            self.send(Method::PUT, url, &[], Some(body)).await?;
            Ok(())
        })
    }

    fn rate_limit_status(&self) -> ApiFuture<'_, RateLimitStatus> {
        Box::pin(async move {
            let url = self.url(&["rate_limit"])?;
            let parsed: GhRateLimit = self.get_json(url, &[]).await?;
            Ok(RateLimitStatus {
                limit: parsed.resources.core.limit,
                remaining: parsed.resources.core.remaining,
                reset_at: parsed.resources.core.reset,
            })
        })
    }
}

/// Maps a non-2xx response into the error taxonomy. Throttling is reported as
/// [`Error::RateLimited`] so callers can retry it.
pub fn error_from_response(status: u16, headers: &HeaderMap, body: &str) -> Error {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
    };

    let quota_exhausted = header("x-ratelimit-remaining") == Some("0");
    let secondary_limit = status == 403 && body.to_ascii_lowercase().contains("rate limit");
    if status == 429 || (status == 403 && (quota_exhausted || secondary_limit)) {
        let retry_after = header(RETRY_AFTER.as_str())
            .and_then(parse_retry_after)
            .or_else(|| {
                header("x-ratelimit-reset")
                    .and_then(|v| v.parse::<i64>().ok())
                    .map(|reset| {
                        let now = chrono::Utc::now().timestamp();
                        Duration::from_secs(reset.saturating_sub(now).max(0) as u64)
                    })
            });
        return Error::RateLimited {
            status,
            retry_after,
        };
    }

    let message = serde_json::from_str::<GhErrorBody>(body)
        .ok()
        .and_then(|b| b.message)
        .unwrap_or_else(|| body.chars().take(200).collect());
    Error::RemoteApi { status, message }
}

/// `Retry-After` as delta-seconds or an HTTP date.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    if let Ok(secs) = value.trim().parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = chrono::DateTime::parse_from_rfc2822(value.trim()).ok()?;
    let delta = at.with_timezone(&chrono::Utc) - chrono::Utc::now();
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}

#[derive(Debug, Deserialize)]
struct GhRepository {
    default_branch: String,
    permissions: Option<GhPermissions>,
}

#[derive(Debug, Deserialize)]
struct GhPermissions {
    push: bool,
}

#[derive(Debug, Deserialize)]
struct GhBranch {
    name: String,
    commit: GhCommitRef,
}

#[derive(Debug, Deserialize)]
struct GhCommitRef {
    sha: String,
}

impl From<GhBranch> for BranchInfo {
    fn from(b: GhBranch) -> Self {
        Self {
            name: b.name,
            head_sha: b.commit.sha,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GhRateLimit {
    resources: GhRateLimitResources,
}

#[derive(Debug, Deserialize)]
struct GhRateLimitResources {
    core: GhRateLimitWindow,
}

#[derive(Debug, Deserialize)]
struct GhRateLimitWindow {
    limit: u64,
    remaining: u64,
    reset: u64,
}

#[derive(Debug, Deserialize)]
struct GhErrorBody {
    message: Option<String>,
}

/// One recorded call against [`InMemoryRepositoryApi`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ApiCall {
    GetRepository,
    ListBranches,
    GetBranch { branch: String },
    CreateBranch { branch: String, from_sha: String },
    GetFile { path: String },
    PutFile { path: String, branch: String, message: String },
    RateLimitStatus,
}

/// Failure to inject into the next matching call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedFailure {
    Status(u16),
    RateLimited(Option<Duration>),
}

impl ScriptedFailure {
    fn into_error(self) -> Error {
        match self {
            Self::Status(status) => Error::RemoteApi {
                status,
                message: format!("scripted http {status}"),
            },
            Self::RateLimited(retry_after) => Error::RateLimited {
                status: 429,
                retry_after,
            },
        }
    }
}

#[derive(Debug)]
struct MemoryRepo {
    default_branch: String,
    branches: BTreeMap<String, String>,
    files: BTreeMap<(String, String), (String, String)>,
    calls: Vec<(Instant, ApiCall)>,
    repository_failure: Option<ScriptedFailure>,
    list_branches_failure: Option<ScriptedFailure>,
    create_branch_failure: Option<ScriptedFailure>,
    put_failures: VecDeque<ScriptedFailure>,
    path_failures: BTreeMap<String, ScriptedFailure>,
    quota: RateLimitStatus,
    commits: u64,
}

/// Repository host kept in memory, for tests and dry runs.
pub struct InMemoryRepositoryApi {
    inner: Mutex<MemoryRepo>,
    put_delay: Duration,
}

impl InMemoryRepositoryApi {
    pub fn new(default_branch: &str) -> Self {
        let mut branches = BTreeMap::new();
        branches.insert(default_branch.to_string(), "c0".to_string());
        Self {
            inner: Mutex::new(MemoryRepo {
                default_branch: default_branch.to_string(),
                branches,
                files: BTreeMap::new(),
                calls: Vec::new(),
                repository_failure: None,
                list_branches_failure: None,
                create_branch_failure: None,
                put_failures: VecDeque::new(),
                path_failures: BTreeMap::new(),
                quota: RateLimitStatus {
                    limit: 5000,
                    remaining: 5000,
                    reset_at: 0,
                },
                commits: 0,
            }),
            put_delay: Duration::ZERO,
        }
    }

    /// Every successful `put_file` takes this long.
    pub fn with_put_delay(mut self, delay: Duration) -> Self {
        self.put_delay = delay;
        self
    }

    pub fn fail_repository(&self, failure: ScriptedFailure) {
        self.lock().repository_failure = Some(failure);
    }

    pub fn fail_list_branches(&self, failure: ScriptedFailure) {
        self.lock().list_branches_failure = Some(failure);
    }

    pub fn fail_create_branch(&self, failure: ScriptedFailure) {
        self.lock().create_branch_failure = Some(failure);
    }

    pub fn push_put_failure(&self, failure: ScriptedFailure) {
        self.lock().put_failures.push_back(failure);
    }

    /// Every `put_file` for `path` fails with `failure`.
    pub fn fail_path(&self, path: &str, failure: ScriptedFailure) {
        self.lock().path_failures.insert(path.to_string(), failure);
    }

    pub fn set_quota(&self, remaining: u64, reset_at: u64) {
        let mut inner = self.lock();
        inner.quota.remaining = remaining;
        inner.quota.reset_at = reset_at;
    }

    pub fn calls(&self) -> Vec<ApiCall> {
        self.lock().calls.iter().map(|(_, c)| c.clone()).collect()
    }

    pub fn timed_calls(&self) -> Vec<(Instant, ApiCall)> {
        self.lock().calls.clone()
    }

    /// Paths of every attempted `put_file`, including failed attempts.
    pub fn put_paths(&self) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter_map(|(_, c)| match c {
                ApiCall::PutFile { path, .. } => Some(path.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn branches(&self) -> Vec<String> {
        self.lock().branches.keys().cloned().collect()
    }

    pub fn file(&self, branch: &str, path: &str) -> Option<String> {
        let inner = self.lock();
        let (_, b64) = inner.files.get(&(branch.to_string(), path.to_string()))?;
        let bytes = base64::engine::general_purpose::STANDARD.decode(b64).ok()?;
        String::from_utf8(bytes).ok()
    }

    pub fn file_count(&self, branch: &str) -> usize {
        self.lock()
            .files
            .keys()
            .filter(|(b, _)| b == branch)
            .count()
    }

    fn record(&self, call: ApiCall) {
        self.lock().calls.push((Instant::now(), call));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryRepo> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl RepositoryApi for InMemoryRepositoryApi {
    fn provider(&self) -> &'static str {
        "test.mem"
    }

    fn get_repository<'a>(&'a self, _owner: &'a str, _repo: &'a str) -> ApiFuture<'a, RepositoryInfo> {
        Box::pin(async move {
            self.record(ApiCall::GetRepository);
            let inner = self.lock();
            if let Some(f) = inner.repository_failure {
                return Err(f.into_error());
            }
            Ok(RepositoryInfo {
                default_branch: inner.default_branch.clone(),
                can_push: Some(true),
            })
        })
    }

    fn list_branches<'a>(&'a self, _owner: &'a str, _repo: &'a str) -> ApiFuture<'a, Vec<BranchInfo>> {
        Box::pin(async move {
            self.record(ApiCall::ListBranches);
            let inner = self.lock();
            if let Some(f) = inner.list_branches_failure {
                return Err(f.into_error());
            }
            Ok(inner
                .branches
                .iter()
                .map(|(name, sha)| BranchInfo {
                    name: name.clone(),
                    head_sha: sha.clone(),
                })
                .collect())
        })
    }

    fn get_branch<'a>(
        &'a self,
        _owner: &'a str,
        _repo: &'a str,
        branch: &'a str,
    ) -> ApiFuture<'a, Option<BranchInfo>> {
        Box::pin(async move {
            self.record(ApiCall::GetBranch {
                branch: branch.to_string(),
            });
            Ok(self.lock().branches.get(branch).map(|sha| BranchInfo {
                name: branch.to_string(),
                head_sha: sha.clone(),
            }))
        })
    }

    fn create_branch<'a>(
        &'a self,
        _owner: &'a str,
        _repo: &'a str,
        branch: &'a str,
        from_sha: &'a str,
    ) -> ApiFuture<'a, ()> {
        Box::pin(async move {
            self.record(ApiCall::CreateBranch {
                branch: branch.to_string(),
                from_sha: from_sha.to_string(),
            });
            let mut inner = self.lock();
            if let Some(f) = inner.create_branch_failure {
                return Err(f.into_error());
            }
            if inner.branches.contains_key(branch) {
                return Err(Error::RemoteApi {
                    status: 422,
                    message: "Reference already exists".to_string(),
                });
            }
            inner
                .branches
                .insert(branch.to_string(), from_sha.to_string());
            Ok(())
        })
    }

    fn get_file<'a>(
        &'a self,
        _owner: &'a str,
        _repo: &'a str,
        path: &'a str,
        branch: &'a str,
    ) -> ApiFuture<'a, Option<RemoteFile>> {
        Box::pin(async move {
            self.record(ApiCall::GetFile {
                path: path.to_string(),
            });
            Ok(self
                .lock()
                .files
                .get(&(branch.to_string(), path.to_string()))
                .map(|(sha, _)| RemoteFile { sha: sha.clone() }))
        })
    }

    fn put_file<'a>(&'a self, request: &'a PutFileRequest) -> ApiFuture<'a, ()> {
        Box::pin(async move {
            self.record(ApiCall::PutFile {
                path: request.path.clone(),
                branch: request.branch.clone(),
                message: request.message.clone(),
            });
            {
                let mut inner = self.lock();
                if let Some(f) = inner.put_failures.pop_front() {
                    return Err(f.into_error());
                }
                if let Some(f) = inner.path_failures.get(&request.path) {
                    return Err(f.into_error());
                }
            }
            if !self.put_delay.is_zero() {
                tokio::time::sleep(self.put_delay).await;
            }

            let mut inner = self.lock();
            if !inner.branches.contains_key(&request.branch) {
                return Err(Error::RemoteApi {
                    status: 404,
                    message: format!("branch not found: {}", request.branch),
                });
            }
            let key = (request.branch.clone(), request.path.clone());
            let current = inner.files.get(&key).map(|(sha, _)| sha.clone());
            if current != request.sha {
                return Err(Error::RemoteApi {
                    status: 409,
                    message: format!("sha mismatch for {}", request.path),
                });
            }
            let sha = blake3::hash(request.content_base64.as_bytes()).to_hex()[..40].to_string();
            inner
                .files
                .insert(key, (sha, request.content_base64.clone()));
            inner.commits += 1;
            let head = format!("c{}", inner.commits);
            inner.branches.insert(request.branch.clone(), head);
            Ok(())
        })
    }

    fn rate_limit_status(&self) -> ApiFuture<'_, RateLimitStatus> {
        Box::pin(async move {
            self.record(ApiCall::RateLimitStatus);
            Ok(self.lock().quota.clone())
        })
    }
}
