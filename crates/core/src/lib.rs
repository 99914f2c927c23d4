pub mod archive;
pub mod channel;
pub mod config;
mod coordinator;
mod error;
pub mod ignore_filter;
mod pipeline;
pub mod progress;
pub mod protocol;
mod rate_limit;
pub mod remote;
pub mod run_log;
mod task_queue;

pub const APP_NAME: &str = "repodrop";

pub use channel::{ChannelEvent, ChannelOptions, ChannelState, ConnectionChannel, Delivery, Link};
pub use config::Settings;
pub use coordinator::{ApiFactory, Coordinator, EndpointId};
pub use error::{Error, ErrorCategory, Result};
pub use pipeline::{ProjectContext, SyncPipeline, SyncReport, SyncTarget, new_run_id};
pub use progress::{ProgressSink, RecordingSink, SyncPhase, UploadProgress};
pub use protocol::{ArchiveReady, Message};
pub use rate_limit::{RateLimitSignal, RateLimiter, RateLimiterState};
pub use remote::{GitHubApi, GitHubApiConfig, InMemoryRepositoryApi, RepositoryApi};
pub use task_queue::{TaskHandle, TaskQueue};
