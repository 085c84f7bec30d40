//! Platform gateway contract + the Reddit implementation.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use rsarb_core::{Comment, Entity, EntityError, Post, ThreadRef, DELETED_AUTHOR};
use thiserror::Error;

#[cfg(any(test, feature = "fake"))]
pub mod fake;
pub mod reddit;

pub use reddit::{RedditCredentials, RedditGateway};

pub const CRATE_NAME: &str = "rsarb-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Error)]
pub enum PlatformError {
    /// The target is locked, archived or otherwise immutable.
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error(transparent)]
    Entity(#[from] EntityError),
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("reddit rejected the request: {0}")]
    Api(String),
    #[error("unexpected response from {url}: {detail}")]
    Decode { url: String, detail: String },
}

impl PlatformError {
    /// Whether the next scheduled tick may reasonably succeed.
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Request { source, .. } => classify_reqwest_error(source),
            Self::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            Self::Api(_) => RetryDisposition::Retryable,
            Self::Forbidden(_) | Self::Entity(_) | Self::Auth(_) | Self::Decode { .. } => {
                RetryDisposition::NonRetryable
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: format!("rsarb/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Operations the bot needs from the discussion platform.
#[async_trait]
pub trait PlatformGateway: Send + Sync {
    /// Identity the bot is authenticated as.
    async fn current_user(&self) -> Result<String, PlatformError>;

    /// Newest posts first across a `+`-joined list of subreddits.
    async fn list_new_posts(&self, forums: &str, limit: Option<usize>) -> Result<Vec<Post>, PlatformError>;

    /// Every comment under the post, flattened across reply depth.
    async fn list_comments(&self, post: &Post) -> Result<Vec<Comment>, PlatformError>;

    /// `Ok(None)` when the thread does not exist.
    async fn resolve_thread(&self, thread: &ThreadRef) -> Result<Option<Post>, PlatformError>;

    /// `Ok(None)` means the platform accepted the call but returned no reply;
    /// the reply may or may not exist.
    async fn post_reply(&self, target: &Entity, body: &str) -> Result<Option<Comment>, PlatformError>;

    /// Every reply authored by `identity`, in no particular order.
    async fn list_own_replies(&self, identity: &str) -> Result<Vec<Comment>, PlatformError>;

    /// Up to `limit` replies by `identity`, newest first by creation time.
    async fn recent_own_replies(&self, identity: &str, limit: usize) -> Result<Vec<Comment>, PlatformError>;

    async fn find_thread(
        &self,
        fullname: Option<&str>,
        uri: Option<&str>,
    ) -> Result<Option<Post>, PlatformError> {
        let thread = ThreadRef::from_parts(fullname, uri)?;
        self.resolve_thread(&thread).await
    }

    /// Lower-cased, deduplicated commenters of a thread.
    async fn list_thread_authors(&self, post: &Post) -> Result<BTreeSet<String>, PlatformError> {
        Ok(self
            .list_comments(post)
            .await?
            .into_iter()
            .map(|comment| comment.author.to_lowercase())
            .filter(|author| author != DELETED_AUTHOR)
            .collect())
    }
}
