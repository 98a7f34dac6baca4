//! Resolve Reddit post links to their HLS video manifests and hand them to
//! ffmpeg.
//!
//! ```no_run
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! use redvid::{config, MediaLookup, OutputMode, RedditExtractor};
//!
//! let config = config::get_config()?.with_env_overrides();
//! let extractor = RedditExtractor::new(&config)?;
//!
//! let post = extractor
//!     .classify("https://www.reddit.com/r/videos/comments/abc123/title/")
//!     .expect("a post link");
//! if let MediaLookup::Found(manifest) = extractor.resolve(&post).await? {
//!     let path = extractor
//!         .start_transcode(&manifest, OutputMode::temp_file())
//!         .await?
//!         .run()?;
//!     println!("saved {}", path.display());
//! }
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod config;
pub mod extractor;
pub mod ffmpeg;

pub use auth::{AuthError, AuthToken, AuthorizedClient, Credentials, TokenProvider};
pub use extractor::{
    extract_manifest, extract_video_link, ErrorKind, ExtractError, LinkClassifier,
    LinkNormalizer, MediaLookup, PostReference, RedditExtractor, RedirectResolver, SetupError,
};
pub use ffmpeg::{OutputMode, TranscodeCommand, TranscodeError, TranscodeRequest, TranscodeStream};
