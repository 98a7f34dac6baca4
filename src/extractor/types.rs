use crate::auth::AuthError;
use super::tokens::TokenError;
use reqwest::StatusCode;
use std::error::Error as StdError;
use std::fmt;
use std::io;
use thiserror::Error;
use url::Url;

type BoxError = Box<dyn StdError + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("request timed out: {0}")]
    Timeout(#[source] BoxError),
    #[error("network error: {0}")]
    Network(#[source] reqwest::Error),
    #[error("unexpected HTTP status {status} from {url}")]
    Status { status: StatusCode, url: Url },
    #[error("failed reading response body: {0}")]
    Read(#[source] io::Error),
    #[error("redirect without a usable Location header: {0}")]
    RedirectProtocolViolation(String),
    /// `body` holds the start of the response for diagnostics and is kept
    /// out of the message.
    #[error("unexpected content type {content_type:?} from {url}")]
    UnexpectedContentType {
        content_type: String,
        url: Url,
        body: String,
    },
    /// `remainder` holds the unread tail of the document for diagnostics.
    #[error("malformed metadata document: {source}")]
    DocumentMalformed {
        #[source]
        source: TokenError,
        remainder: String,
    },
    #[error("invalid manifest URL {value:?}: {reason}")]
    ManifestUrlInvalid { value: String, reason: String },
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),
}

/// Coarse classification of [`ExtractError`] for callers choosing a
/// user-facing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Timeout,
    Transport,
    RedirectProtocolViolation,
    UnexpectedContentType,
    DocumentMalformed,
    ManifestUrlInvalid,
    Authentication,
}

impl ExtractError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExtractError::Timeout(_) => ErrorKind::Timeout,
            ExtractError::Network(_) | ExtractError::Status { .. } | ExtractError::Read(_) => {
                ErrorKind::Transport
            }
            ExtractError::RedirectProtocolViolation(_) => ErrorKind::RedirectProtocolViolation,
            ExtractError::UnexpectedContentType { .. } => ErrorKind::UnexpectedContentType,
            ExtractError::DocumentMalformed { .. } => ErrorKind::DocumentMalformed,
            ExtractError::ManifestUrlInvalid { .. } => ErrorKind::ManifestUrlInvalid,
            ExtractError::Auth(_) => ErrorKind::Authentication,
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }

    /// Classifies an I/O error raised while streaming a response body.
    pub(crate) fn from_io(error: io::Error) -> Self {
        let timed_out = error.kind() == io::ErrorKind::TimedOut
            || error
                .get_ref()
                .and_then(|inner| inner.downcast_ref::<reqwest::Error>())
                .is_some_and(reqwest::Error::is_timeout);
        if timed_out {
            ExtractError::Timeout(Box::new(error))
        } else {
            ExtractError::Read(error)
        }
    }

    pub(crate) fn from_token(error: TokenError, remainder: String) -> Self {
        match error {
            TokenError::Io(e) => ExtractError::from_io(e),
            source => ExtractError::DocumentMalformed { source, remainder },
        }
    }
}

impl From<reqwest::Error> for ExtractError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            ExtractError::Timeout(Box::new(error))
        } else {
            ExtractError::Network(error)
        }
    }
}

/// Outcome of looking for a video in a post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaLookup {
    /// HLS manifest of the post's video.
    Found(Url),
    /// The post is well-formed but carries no video.
    Absent,
}

impl MediaLookup {
    pub fn manifest(&self) -> Option<&Url> {
        match self {
            MediaLookup::Found(url) => Some(url),
            MediaLookup::Absent => None,
        }
    }

    pub fn into_manifest(self) -> Option<Url> {
        match self {
            MediaLookup::Found(url) => Some(url),
            MediaLookup::Absent => None,
        }
    }
}

/// A URL that passed link classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostReference(Url);

impl PostReference {
    pub(crate) fn new(url: Url) -> Self {
        Self(url)
    }

    pub fn url(&self) -> &Url {
        &self.0
    }
}

impl fmt::Display for PostReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Invalid settings detected while building the pipeline.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("invalid link pattern: {0}")]
    LinkPattern(#[from] regex::Error),
    #[error("invalid token URL {url:?}: {source}")]
    TokenUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("invalid API host {0:?}")]
    ApiHost(String),
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}
