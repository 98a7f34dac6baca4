#![allow(dead_code)]

use redvid::config::Config;
use wiremock::MockServer;

pub const USER_AGENT: &str = "redvid-tests/1.0";
pub const TOKEN_PATH: &str = "/api/v1/access_token";

/// Accepts post links on the mock server instead of reddit.com.
pub const LOCAL_LINK_PATTERN: &str = r"^http://127\.0\.0\.1:\d+/r/[^/]+/(?:comments|s)/.+";

pub const VIDEO_POST: &str = r#"[
  {"kind": "Listing", "data": {"children": [{"kind": "t3", "data": {
    "title": "a video",
    "media": {"reddit_video": {"hls_url": "https://v.redd.it/abc123/HLSPlaylist.m3u8?a=1"}},
    "secure_media": {"reddit_video": {
      "bitrate_kbps": 2400,
      "fallback_url": "https://v.redd.it/abc123/DASH_720.mp4",
      "hls_url": "https://v.redd.it/abc123/HLSPlaylist.m3u8?a=1&v=1",
      "is_gif": false
    }}
  }}]}},
  {"kind": "Listing", "data": {"children": []}}
]"#;

pub const TEXT_POST: &str = r#"[{"kind": "Listing", "data": {"children": [{"kind": "t3",
  "data": {"title": "words only", "secure_media": null, "selftext": "hi"}}]}}]"#;

pub fn anonymous_config(server: &MockServer) -> Config {
    let mut config = Config::default();
    config.reddit.link_pattern = LOCAL_LINK_PATTERN.into();
    config.reddit.user_agent = USER_AGENT.into();
    config.reddit.token_url = format!("{}{}", server.uri(), TOKEN_PATH);
    config.reddit.timeout_secs = 5;
    config
}

pub fn authenticated_config(server: &MockServer) -> Config {
    let mut config = anonymous_config(server);
    config.reddit.client_id = Some("id".into());
    config.reddit.client_secret = Some("secret".into());
    config.reddit.api_host = "127.0.0.1".into();
    config
}

pub fn post_link(server: &MockServer, path: &str) -> String {
    format!("{}{}", server.uri(), path)
}
