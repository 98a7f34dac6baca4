//! Locates `secure_media.reddit_video.hls_url` in a post's metadata document.
//!
//! The document is scanned token by token and abandoned as soon as the
//! manifest link is read. Reddit listings are large and most of their
//! content is comments, so nothing past the link is ever pulled from the
//! stream.

use super::tokens::{Token, TokenError, TokenReader};
use super::types::{ExtractError, MediaLookup};
use tokio::io::{AsyncBufRead, AsyncReadExt};
use tracing::{debug, warn};
use url::Url;

const SECURE_MEDIA: &str = "secure_media";
const REDDIT_VIDEO: &str = "reddit_video";
const HLS_URL: &str = "hls_url";

/// Upper bound on the unread tail kept for diagnostics.
pub const DIAGNOSTIC_LIMIT: u64 = 64 * 1024;

/// Scan a metadata document for the post's HLS manifest.
pub async fn extract_manifest<R>(reader: R) -> Result<MediaLookup, ExtractError>
where
    R: AsyncBufRead + Unpin,
{
    let mut tokens = TokenReader::new(reader);
    match scan_document(&mut tokens).await {
        Ok(lookup) => Ok(lookup),
        Err(ScanError::Token(TokenError::Io(e))) => Err(ExtractError::from_io(e)),
        Err(ScanError::Token(e)) => {
            let offset = tokens.offset();
            let remainder = read_remainder(tokens.into_inner()).await;
            warn!(offset, error = %e, "metadata document could not be decoded");
            debug!(remainder = %remainder, "unread tail of malformed document");
            Err(ExtractError::from_token(e, remainder))
        }
        Err(ScanError::Manifest { value, reason }) => {
            warn!(value = %value, reason = %reason, "manifest link is not a valid URL");
            Err(ExtractError::ManifestUrlInvalid { value, reason })
        }
    }
}

enum ScanError {
    Token(TokenError),
    Manifest { value: String, reason: String },
}

impl From<TokenError> for ScanError {
    fn from(error: TokenError) -> Self {
        ScanError::Token(error)
    }
}

async fn scan_document<R>(tokens: &mut TokenReader<R>) -> Result<MediaLookup, ScanError>
where
    R: AsyncBufRead + Unpin,
{
    while let Some(token) = tokens.next_token().await? {
        if matches!(&token, Token::Name(name) if name == SECURE_MEDIA) {
            return scan_secure_media(tokens).await;
        }
    }
    Ok(MediaLookup::Absent)
}

async fn scan_secure_media<R>(tokens: &mut TokenReader<R>) -> Result<MediaLookup, ScanError>
where
    R: AsyncBufRead + Unpin,
{
    match next_required(tokens).await? {
        Token::Null => return Ok(MediaLookup::Absent),
        Token::BeginObject => {}
        other => {
            warn!(token = ?other, "secure_media is neither an object nor null");
            return Ok(MediaLookup::Absent);
        }
    }

    // The object just opened; leaving this depth means it closed.
    let depth = tokens.depth();
    match next_required(tokens).await? {
        Token::EndObject => return Ok(MediaLookup::Absent),
        Token::Name(name) if name == REDDIT_VIDEO => {}
        Token::Name(name) if name == HLS_URL => return read_manifest(tokens).await,
        other => warn!(field = ?other, "secure_media holds something other than reddit_video"),
    }

    loop {
        match next_required(tokens).await? {
            Token::Name(name) if name == HLS_URL => return read_manifest(tokens).await,
            Token::EndObject if tokens.depth() < depth => return Ok(MediaLookup::Absent),
            _ => {}
        }
    }
}

async fn read_manifest<R>(tokens: &mut TokenReader<R>) -> Result<MediaLookup, ScanError>
where
    R: AsyncBufRead + Unpin,
{
    match next_required(tokens).await? {
        Token::String(value) => match Url::parse(&value) {
            Ok(url) => Ok(MediaLookup::Found(url)),
            Err(e) => Err(ScanError::Manifest {
                value,
                reason: e.to_string(),
            }),
        },
        other => Err(ScanError::Manifest {
            value: format!("{:?}", other),
            reason: "hls_url is not a string".into(),
        }),
    }
}

/// Like `next_token`, but running out of input inside `secure_media` means
/// the document was cut short.
async fn next_required<R>(tokens: &mut TokenReader<R>) -> Result<Token, ScanError>
where
    R: AsyncBufRead + Unpin,
{
    tokens.next_token().await?.ok_or_else(|| {
        ScanError::Token(TokenError::Syntax {
            offset: tokens.offset(),
            message: "document ended inside secure_media".into(),
        })
    })
}

async fn read_remainder<R>(reader: R) -> String
where
    R: AsyncBufRead + Unpin,
{
    let mut rest = Vec::new();
    if let Err(e) = reader.take(DIAGNOSTIC_LIMIT).read_to_end(&mut rest).await {
        debug!(error = %e, "could not read the rest of the document");
    }
    String::from_utf8_lossy(&rest).into_owned()
}
