use super::manifest::{extract_manifest, DIAGNOSTIC_LIMIT};
use super::types::*;
use crate::auth::{AuthorizedClient, TokenProvider};
use crate::config::{Config, RedditConfig};
use crate::ffmpeg::{OutputMode, TranscodeCommand, TranscodeError, TranscodeRequest};
use futures::TryStreamExt;
use regex::Regex;
use reqwest::header::{CONTENT_TYPE, LOCATION};
use reqwest::redirect::Policy;
use reqwest::{Client, Response, StatusCode};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::io::StreamReader;
use tracing::{debug, info, warn};
use url::Url;

const DOCUMENT_SUFFIX: &str = ".json";

/// Decides whether a link points at a Reddit post.
#[derive(Debug, Clone)]
pub struct LinkClassifier {
    pattern: Regex,
}

impl LinkClassifier {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
        })
    }

    pub fn is_supported(&self, url: &Url) -> bool {
        self.pattern.is_match(url.as_str())
    }

    pub fn classify(&self, link: &str) -> Option<PostReference> {
        let url = Url::parse(link.trim()).ok()?;
        self.is_supported(&url).then(|| PostReference::new(url))
    }
}

/// Turns a canonical post URL into the URL of its JSON metadata document.
#[derive(Debug, Clone, Default)]
pub struct LinkNormalizer {
    api_host: Option<String>,
}

impl LinkNormalizer {
    /// `api_host` replaces the post's host; pass `None` to keep it.
    pub fn new(api_host: Option<String>) -> Self {
        Self { api_host }
    }

    pub fn to_document_url(&self, url: &Url) -> Url {
        let mut document = url.clone();
        document.set_query(None);
        document.set_fragment(None);

        if !document.path().ends_with(DOCUMENT_SUFFIX) {
            let path = format!(
                "{}/{}",
                document.path().trim_end_matches('/'),
                DOCUMENT_SUFFIX
            );
            document.set_path(&path);
        }

        if let Some(host) = &self.api_host {
            if document.set_host(Some(host.as_str())).is_err() {
                warn!(host = %host, "cannot rewrite document host");
            }
        }
        document
    }
}

/// Follows share links to the post they point at.
#[derive(Debug, Clone)]
pub struct RedirectResolver {
    client: Client,
}

impl RedirectResolver {
    /// `client` must not follow redirects on its own.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn resolve(&self, post: &PostReference) -> Result<Url, ExtractError> {
        let resp = self.client.head(post.url().clone()).send().await?;
        let status = resp.status();
        if !matches!(
            status,
            StatusCode::MOVED_PERMANENTLY | StatusCode::PERMANENT_REDIRECT
        ) {
            return Ok(post.url().clone());
        }

        let location = match resp.headers().get(LOCATION) {
            None => {
                return Err(ExtractError::RedirectProtocolViolation(format!(
                    "{} from {} has no Location header",
                    status, post
                )))
            }
            Some(value) => value.to_str().map_err(|_| {
                ExtractError::RedirectProtocolViolation(format!(
                    "{} from {} has a non-ASCII Location header",
                    status, post
                ))
            })?,
        };
        if location.trim().is_empty() {
            return Err(ExtractError::RedirectProtocolViolation(format!(
                "{} from {} has an empty Location header",
                status, post
            )));
        }

        let canonical = post.url().join(location.trim()).map_err(|e| {
            ExtractError::RedirectProtocolViolation(format!(
                "{} from {} has an invalid Location {:?}: {}",
                status, post, location, e
            ))
        })?;
        debug!(from = %post, to = %canonical, "followed post redirect");
        Ok(canonical)
    }
}

/// Resolves Reddit posts to their HLS manifests and starts transcodes.
pub struct RedditExtractor {
    classifier: LinkClassifier,
    normalizer: LinkNormalizer,
    redirects: RedirectResolver,
    http: AuthorizedClient,
    tokens: Option<Arc<TokenProvider>>,
    user_agent: String,
    ffmpeg_path: Option<PathBuf>,
    diagnostics_dir: Option<PathBuf>,
}

impl RedditExtractor {
    pub fn new(config: &Config) -> Result<Self, SetupError> {
        let reddit = &config.reddit;
        let timeout = Duration::from_secs(reddit.timeout_secs);

        let client = Client::builder()
            .user_agent(reddit.user_agent.as_str())
            .timeout(timeout)
            .build()?;
        let redirect_client = Client::builder()
            .user_agent(reddit.user_agent.as_str())
            .timeout(timeout)
            .redirect(Policy::none())
            .build()?;

        let tokens = match reddit.credentials() {
            Some(credentials) => {
                let token_url = Url::parse(&reddit.token_url).map_err(|source| {
                    SetupError::TokenUrl {
                        url: reddit.token_url.clone(),
                        source,
                    }
                })?;
                Some(Arc::new(TokenProvider::new(
                    client.clone(),
                    token_url,
                    credentials,
                )))
            }
            None => None,
        };

        let normalizer = match &tokens {
            Some(_) => LinkNormalizer::new(Some(validate_host(reddit)?)),
            None => LinkNormalizer::new(None),
        };

        Ok(Self {
            classifier: LinkClassifier::new(&reddit.link_pattern)?,
            normalizer,
            redirects: RedirectResolver::new(redirect_client),
            http: AuthorizedClient::new(client, tokens.clone()),
            tokens,
            user_agent: reddit.user_agent.clone(),
            ffmpeg_path: config.ffmpeg.path.as_ref().map(PathBuf::from),
            diagnostics_dir: reddit.diagnostics_dir.as_ref().map(PathBuf::from),
        })
    }

    pub fn is_authenticated(&self) -> bool {
        self.http.is_authenticated()
    }

    pub fn classifier(&self) -> &LinkClassifier {
        &self.classifier
    }

    pub fn normalizer(&self) -> &LinkNormalizer {
        &self.normalizer
    }

    /// `None` when the link is not a Reddit post.
    pub fn classify(&self, link: &str) -> Option<PostReference> {
        self.classifier.classify(link)
    }

    /// Find the HLS manifest of a post's video.
    pub async fn resolve(&self, post: &PostReference) -> Result<MediaLookup, ExtractError> {
        let canonical = self.redirects.resolve(post).await?;
        let document_url = self.normalizer.to_document_url(&canonical);
        let lookup = self.fetch_manifest(document_url).await?;
        match &lookup {
            MediaLookup::Found(manifest) => info!(post = %post, manifest = %manifest, "found video"),
            MediaLookup::Absent => info!(post = %post, "post has no video"),
        }
        Ok(lookup)
    }

    /// Build an ffmpeg invocation for a manifest, with a freshly checked
    /// token when the extractor is authenticated.
    pub async fn start_transcode(
        &self,
        manifest: &Url,
        mode: OutputMode,
    ) -> Result<TranscodeCommand, TranscodeError> {
        let mut request = TranscodeRequest::new(manifest.clone(), mode)
            .header("User-Agent", self.user_agent.as_str())?;

        if let Some(tokens) = &self.tokens {
            let token = tokens.token().await.map_err(|e| {
                warn!(manifest = %manifest, error = %e, "no token for transcode");
                e
            })?;
            request = request.header("Authorization", token.header_value())?;
        }

        Ok(request.into_command(self.ffmpeg_path.as_deref()))
    }

    async fn fetch_manifest(&self, document_url: Url) -> Result<MediaLookup, ExtractError> {
        let resp = self.http.get(document_url.clone()).await?.send().await?;
        let status = resp.status();
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        if !is_json(&content_type) {
            let body = capture_body(resp).await;
            warn!(url = %document_url, %status, content_type = %content_type, "unexpected response from reddit");
            debug!(body = %body, "unexpected response body");
            if let Some(dir) = &self.diagnostics_dir {
                save_diagnostic(dir, &content_type, &body).await;
            }
            return Err(ExtractError::UnexpectedContentType {
                content_type,
                url: document_url,
                body,
            });
        }
        if !status.is_success() {
            return Err(ExtractError::Status {
                status,
                url: document_url,
            });
        }

        let body = resp.bytes_stream().map_err(io::Error::other);
        extract_manifest(StreamReader::new(Box::pin(body))).await
    }
}

fn validate_host(reddit: &RedditConfig) -> Result<String, SetupError> {
    let host = reddit.api_host.trim();
    match Url::parse(&format!("https://{}/", host)) {
        Ok(url) if url.host_str() == Some(host) => Ok(host.to_string()),
        _ => Err(SetupError::ApiHost(reddit.api_host.clone())),
    }
}

fn essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

fn is_json(content_type: &str) -> bool {
    essence(content_type) == "application/json"
}

/// File extension for a saved response body.
fn diagnostic_extension(content_type: &str) -> &'static str {
    match essence(content_type).as_str() {
        "text/html" | "application/xhtml+xml" => "html",
        "text/xml" | "application/xml" => "xml",
        "text/plain" => "txt",
        _ => "body",
    }
}

/// Read up to [`DIAGNOSTIC_LIMIT`] bytes of a response for logging.
async fn capture_body(mut resp: Response) -> String {
    let mut body = Vec::new();
    loop {
        match resp.chunk().await {
            Ok(Some(chunk)) => {
                body.extend_from_slice(&chunk);
                if body.len() as u64 >= DIAGNOSTIC_LIMIT {
                    body.truncate(DIAGNOSTIC_LIMIT as usize);
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "response body cut short");
                break;
            }
        }
    }
    String::from_utf8_lossy(&body).into_owned()
}

async fn save_diagnostic(dir: &Path, content_type: &str, body: &str) {
    let name = format!(
        "{}.{}",
        chrono::Local::now().format("%Y%m%d-%H%M%S%.3f"),
        diagnostic_extension(content_type)
    );
    let path = dir.join(name);
    let written = match tokio::fs::create_dir_all(dir).await {
        Ok(()) => tokio::fs::write(&path, body).await,
        Err(e) => Err(e),
    };
    match written {
        Ok(()) => info!(path = %path.display(), "saved unexpected response"),
        Err(e) => warn!(path = %path.display(), error = %e, "could not save unexpected response"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> LinkClassifier {
        LinkClassifier::new(&RedditConfig::default().link_pattern).unwrap()
    }

    #[test]
    fn accepts_comment_and_share_links() {
        let classifier = classifier();
        for link in [
            "https://www.reddit.com/r/videos/comments/1abcde/some_title/",
            "https://www.reddit.com/r/videos/comments/1abcde/",
            "https://reddit.com/r/aww/comments/xyz789/cat/?utm_source=share",
            "https://old.reddit.com/r/aww/comments/xyz789/cat/",
            "https://www.reddit.com/r/funny/s/AbCdEf123",
        ] {
            assert!(classifier.classify(link).is_some(), "{link}");
        }
    }

    #[test]
    fn rejects_everything_else() {
        let classifier = classifier();
        for link in [
            "http://www.reddit.com/r/videos/comments/1abcde/",
            "https://www.reddit.com/r/videos/",
            "https://www.reddit.com/r/videos/top/",
            "https://www.reddit.com/user/someone/comments/abc/",
            "https://www.reddit.com/r//comments/abc/",
            "https://v.redd.it/abc123",
            "https://example.com/r/videos/comments/abc/",
            "https://notreddit.com/r/videos/comments/abc/",
            "not a url",
            "",
        ] {
            assert!(classifier.classify(link).is_none(), "{link}");
        }
    }

    #[test]
    fn classified_reference_keeps_the_url() {
        let post = classifier()
            .classify("  https://www.reddit.com/r/funny/s/AbCdEf123  ")
            .unwrap();
        assert_eq!(post.url().as_str(), "https://www.reddit.com/r/funny/s/AbCdEf123");
    }

    #[test]
    fn normalizer_strips_query_and_targets_api_host() {
        let normalizer = LinkNormalizer::new(Some("oauth.reddit.com".into()));
        let url = Url::parse(
            "https://www.reddit.com/r/videos/comments/1abcde/some_title/?utm_source=share#c1",
        )
        .unwrap();
        assert_eq!(
            normalizer.to_document_url(&url).as_str(),
            "https://oauth.reddit.com/r/videos/comments/1abcde/some_title/.json"
        );
    }

    #[test]
    fn anonymous_normalizer_keeps_host() {
        let normalizer = LinkNormalizer::new(None);
        let url = Url::parse("https://www.reddit.com/r/videos/comments/1abcde").unwrap();
        assert_eq!(
            normalizer.to_document_url(&url).as_str(),
            "https://www.reddit.com/r/videos/comments/1abcde/.json"
        );
    }

    #[test]
    fn normalizer_is_idempotent() {
        let normalizer = LinkNormalizer::new(Some("oauth.reddit.com".into()));
        for link in [
            "https://www.reddit.com/r/videos/comments/1abcde/some_title/?context=3",
            "https://www.reddit.com/r/videos/comments/1abcde",
            "http://127.0.0.1:8080/r/videos/comments/1abcde/",
        ] {
            let once = normalizer.to_document_url(&Url::parse(link).unwrap());
            let twice = normalizer.to_document_url(&once);
            assert_eq!(once, twice, "{link}");
        }
    }

    #[test]
    fn json_content_types() {
        assert!(is_json("application/json; charset=UTF-8"));
        assert!(is_json("application/json"));
        assert!(is_json("Application/JSON;charset=utf-8"));
        assert!(!is_json("text/html; charset=utf-8"));
        assert!(!is_json(""));
    }

    #[test]
    fn diagnostic_files_are_named_after_the_content_type() {
        assert_eq!(diagnostic_extension("text/html; charset=utf-8"), "html");
        assert_eq!(diagnostic_extension("Text/XML"), "xml");
        assert_eq!(diagnostic_extension("text/plain"), "txt");
        assert_eq!(diagnostic_extension("image/png"), "body");
        assert_eq!(diagnostic_extension(""), "body");
    }

    #[test]
    fn api_host_is_validated() {
        let mut reddit = RedditConfig::default();
        assert_eq!(validate_host(&reddit).unwrap(), "oauth.reddit.com");

        reddit.api_host = "bad host/with path".into();
        assert!(matches!(validate_host(&reddit), Err(SetupError::ApiHost(_))));
    }

    #[test]
    fn invalid_link_pattern_is_a_setup_error() {
        let mut config = Config::default();
        config.reddit.link_pattern = "(unclosed".into();
        assert!(matches!(
            RedditExtractor::new(&config),
            Err(SetupError::LinkPattern(_))
        ));
    }

    #[tokio::test]
    async fn anonymous_transcode_carries_only_user_agent() {
        let mut config = Config::default();
        config.reddit.user_agent = "redvid/test".into();
        let extractor = RedditExtractor::new(&config).unwrap();
        assert!(!extractor.is_authenticated());

        let manifest = Url::parse("https://v.redd.it/abc/HLSPlaylist.m3u8").unwrap();
        let command = extractor
            .start_transcode(&manifest, OutputMode::Pipe)
            .await
            .unwrap();
        let args = command.get_args();
        assert!(args.contains(&"User-Agent: redvid/test\r\n".to_string()), "{args:?}");
    }
}
