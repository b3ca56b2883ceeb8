//! Media loading collaborator.

use async_trait::async_trait;
use common::EngineError;
use url::Url;

/// What a completed load tells the instance.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LoadedMedia {
    /// Known duration in seconds.
    pub duration: Option<f64>,
    pub content_type: Option<String>,
    pub video_width: u32,
    pub video_height: u32,
}

/// Load error.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum LoadError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("HTTP error: {status}")]
    Http { status: u16 },
    #[error("Timeout")]
    Timeout,
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

impl From<LoadError> for EngineError {
    fn from(err: LoadError) -> Self {
        EngineError::network(err.to_string())
    }
}

/// Fetches the resource behind `load(url)`.
///
/// Implementations do the I/O; the instance only tracks the load state and
/// cancels the spawned fetch on `cancelLoad`.
#[async_trait]
pub trait MediaLoader: Send + Sync {
    async fn fetch(&self, url: &Url) -> Result<LoadedMedia, LoadError>;
}

/// Identifies one `load` call; completions carrying an older ticket are
/// ignored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LoadTicket(pub(crate) u64);

/// Parse a load target.
pub fn parse_media_url(url: &str) -> Result<Url, LoadError> {
    Url::parse(url).map_err(|e| LoadError::InvalidUrl(format!("{}: {}", url, e)))
}
