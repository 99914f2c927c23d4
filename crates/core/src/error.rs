use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("archive is {size} bytes, above the {limit} byte limit")]
    ArchiveTooLarge { size: usize, limit: usize },

    #[error("archive is empty")]
    EmptyArchive,

    #[error("archive is corrupt: {message}")]
    CorruptArchive { message: String },

    #[error("archive contains no files")]
    NoEntries,

    #[error("archive entry is not valid UTF-8 text: {path}")]
    UndecodableEntry { path: String },

    #[error("missing configuration: {field}")]
    MissingConfiguration { field: &'static str },

    #[error("repository not found: {owner}/{repo}")]
    RepositoryNotFound { owner: String, repo: String },

    #[error("insufficient permissions: {message}")]
    InsufficientPermissions { message: String },

    #[error("rate limited (http {status}), retry after {retry_after:?}")]
    RateLimited {
        status: u16,
        retry_after: Option<Duration>,
    },

    #[error("rate limit retries exhausted after {attempts} attempts")]
    RateLimitExhausted { attempts: u32 },

    #[error("failed to create branch {branch}: {message}")]
    BranchCreationFailed { branch: String, message: String },

    #[error("upload timed out after {after:?}")]
    UploadTimeout { after: Duration },

    #[error("transport disconnected")]
    TransportDisconnected,

    #[error("transport is dead")]
    TransportDead,

    #[error("remote api error (http {status}): {message}")]
    RemoteApi { status: u16, message: String },

    #[error("network error: {message}")]
    Network { message: String },

    #[error("a sync is already in progress")]
    Busy,

    #[error("not ready: {message}")]
    NotReady { message: String },

    #[error("stale configuration version {seen} (current {current})")]
    StaleConfig { seen: u64, current: u64 },

    #[error("cancelled")]
    Cancelled,

    #[error("protocol error: {message}")]
    Protocol { message: String },
}

/// Coarse failure class a UI can render guidance for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Auth,
    Permission,
    NotFound,
    RateLimit,
    Network,
    Archive,
    Config,
    Timeout,
    Busy,
    Internal,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Permission => "permission",
            Self::NotFound => "not_found",
            Self::RateLimit => "rate_limit",
            Self::Network => "network",
            Self::Archive => "archive",
            Self::Config => "config",
            Self::Timeout => "timeout",
            Self::Busy => "busy",
            Self::Internal => "internal",
        }
    }
}

impl Error {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::InvalidConfig { .. }
            | Error::MissingConfiguration { .. }
            | Error::StaleConfig { .. }
            | Error::NotReady { .. } => ErrorCategory::Config,
            Error::ArchiveTooLarge { .. }
            | Error::EmptyArchive
            | Error::CorruptArchive { .. }
            | Error::NoEntries
            | Error::UndecodableEntry { .. } => ErrorCategory::Archive,
            Error::RepositoryNotFound { .. } => ErrorCategory::NotFound,
            Error::InsufficientPermissions { .. } | Error::BranchCreationFailed { .. } => {
                ErrorCategory::Permission
            }
            Error::RateLimited { .. } | Error::RateLimitExhausted { .. } => {
                ErrorCategory::RateLimit
            }
            Error::UploadTimeout { .. } => ErrorCategory::Timeout,
            Error::TransportDisconnected | Error::TransportDead | Error::Network { .. } => {
                ErrorCategory::Network
            }
            Error::RemoteApi { status, .. } => match *status {
                401 => ErrorCategory::Auth,
                403 => ErrorCategory::Permission,
                404 => ErrorCategory::NotFound,
                429 => ErrorCategory::RateLimit,
                s if s >= 500 => ErrorCategory::Network,
                _ => ErrorCategory::Internal,
            },
            Error::Busy => ErrorCategory::Busy,
            Error::Io(_) | Error::Cancelled | Error::Protocol { .. } => ErrorCategory::Internal,
        }
    }

    /// One line suitable for the `error` progress message.
    pub fn user_message(&self) -> String {
        match self.category() {
            ErrorCategory::Auth => {
                format!("Authentication failed, check the access token ({self})")
            }
            ErrorCategory::Permission => {
                format!("The token lacks write access to the repository ({self})")
            }
            ErrorCategory::NotFound => {
                format!("Repository not found, check owner and name ({self})")
            }
            ErrorCategory::RateLimit => {
                format!("GitHub rate limit reached, try again later ({self})")
            }
            ErrorCategory::Network => format!("Could not reach GitHub ({self})"),
            ErrorCategory::Timeout => format!("Upload took too long and was stopped ({self})"),
            ErrorCategory::Archive | ErrorCategory::Config | ErrorCategory::Busy => {
                let mut msg = self.to_string();
                if let Some(first) = msg.get_mut(0..1) {
                    first.make_ascii_uppercase();
                }
                msg
            }
            ErrorCategory::Internal => format!("Upload failed: {self}"),
        }
    }

    /// Stable code carried in `rejected` messages and run summaries.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidConfig { .. } => "config.invalid",
            Error::Io(_) => "io",
            Error::ArchiveTooLarge { .. } => "archive.too_large",
            Error::EmptyArchive => "archive.empty",
            Error::CorruptArchive { .. } => "archive.corrupt",
            Error::NoEntries => "archive.no_entries",
            Error::UndecodableEntry { .. } => "archive.undecodable_entry",
            Error::MissingConfiguration { .. } => "config.missing",
            Error::RepositoryNotFound { .. } => "remote.repository_not_found",
            Error::InsufficientPermissions { .. } => "remote.insufficient_permissions",
            Error::RateLimited { .. } => "remote.rate_limited",
            Error::RateLimitExhausted { .. } => "remote.rate_limit_exhausted",
            Error::BranchCreationFailed { .. } => "remote.branch_creation_failed",
            Error::UploadTimeout { .. } => "sync.timeout",
            Error::TransportDisconnected => "transport.disconnected",
            Error::TransportDead => "transport.dead",
            Error::RemoteApi { .. } => "remote.api",
            Error::Network { .. } => "remote.network",
            Error::Busy => "sync.busy",
            Error::NotReady { .. } => "sync.not_ready",
            Error::StaleConfig { .. } => "config.stale",
            Error::Cancelled => "cancelled",
            Error::Protocol { .. } => "protocol.invalid",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_status_codes_map_to_categories() {
        let cat = |status| {
            Error::RemoteApi {
                status,
                message: String::new(),
            }
            .category()
        };
        assert_eq!(cat(401), ErrorCategory::Auth);
        assert_eq!(cat(403), ErrorCategory::Permission);
        assert_eq!(cat(404), ErrorCategory::NotFound);
        assert_eq!(cat(429), ErrorCategory::RateLimit);
        assert_eq!(cat(502), ErrorCategory::Network);
        assert_eq!(cat(422), ErrorCategory::Internal);
    }

    #[test]
    fn user_message_capitalizes_plain_errors() {
        assert_eq!(Error::EmptyArchive.user_message(), "Archive is empty");
        assert!(
            Error::RateLimitExhausted { attempts: 5 }
                .user_message()
                .contains("rate limit")
        );
    }
}
