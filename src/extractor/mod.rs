mod manifest;
mod reddit;
mod tokens;
mod types;

pub use manifest::{extract_manifest, DIAGNOSTIC_LIMIT};
pub use reddit::{LinkClassifier, LinkNormalizer, RedditExtractor, RedirectResolver};
pub use tokens::{Token, TokenError, TokenReader};
pub use types::*;

use tracing::debug;

/// Resolve a link to a video manifest.
///
/// Returns `Ok(None)` when the link is not a Reddit post at all, so callers
/// can skip unrelated links without treating them as failures.
pub async fn extract_video_link(
    extractor: &RedditExtractor,
    link: &str,
) -> Result<Option<MediaLookup>, ExtractError> {
    let Some(post) = extractor.classify(link) else {
        debug!(link = %link, "not a reddit post link");
        return Ok(None);
    };
    extractor.resolve(&post).await.map(Some)
}
