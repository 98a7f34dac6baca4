use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

use crate::auth::{Credentials, DEFAULT_TOKEN_URL};

pub const CLIENT_ID_ENV: &str = "REDVID_CLIENT_ID";
pub const CLIENT_SECRET_ENV: &str = "REDVID_CLIENT_SECRET";
pub const USER_AGENT_ENV: &str = "REDVID_USER_AGENT";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedditConfig {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    /// Host serving metadata documents to authenticated clients.
    #[serde(default = "default_api_host")]
    pub api_host: String,
    /// Regex a link must match to be treated as a post.
    #[serde(default = "default_link_pattern")]
    pub link_pattern: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Where unexpected response bodies are saved, if anywhere.
    #[serde(default)]
    pub diagnostics_dir: Option<String>,
}

fn default_user_agent() -> String {
    format!("redvid/{} (video link resolver)", env!("CARGO_PKG_VERSION"))
}

fn default_token_url() -> String {
    DEFAULT_TOKEN_URL.to_string()
}

fn default_api_host() -> String {
    "oauth.reddit.com".to_string()
}

fn default_link_pattern() -> String {
    r"^https://(?:www\.|old\.|new\.)?reddit\.com/r/[^/]+/(?:comments|s)/.+".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for RedditConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            client_secret: None,
            user_agent: default_user_agent(),
            token_url: default_token_url(),
            api_host: default_api_host(),
            link_pattern: default_link_pattern(),
            timeout_secs: default_timeout_secs(),
            diagnostics_dir: None,
        }
    }
}

impl RedditConfig {
    /// Client credentials, when both halves are present and non-empty.
    pub fn credentials(&self) -> Option<Credentials> {
        let client_id = self.client_id.as_deref().filter(|s| !s.is_empty())?;
        let client_secret = self.client_secret.as_deref().filter(|s| !s.is_empty())?;
        Some(Credentials {
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FfmpegConfig {
    /// Explicit ffmpeg binary; otherwise ffmpeg-sidecar locates one.
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub reddit: RedditConfig,
    #[serde(default)]
    pub ffmpeg: FfmpegConfig,
}

impl Config {
    /// Apply `REDVID_*` environment variables on top of the file values.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(id) = lookup(CLIENT_ID_ENV) {
            self.reddit.client_id = Some(id);
        }
        if let Some(secret) = lookup(CLIENT_SECRET_ENV) {
            self.reddit.client_secret = Some(secret);
        }
        if let Some(agent) = lookup(USER_AGENT_ENV).filter(|s| !s.is_empty()) {
            self.reddit.user_agent = agent;
        }
        self
    }
}

fn config_dir() -> PathBuf {
    // Same location on every platform: ~/.config/redvid/
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("redvid")
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.yml")
}

pub fn get_config() -> Result<Config, Box<dyn std::error::Error>> {
    load_config_from(config_path())
}

pub fn load_config_from(path: PathBuf) -> Result<Config, Box<dyn std::error::Error>> {
    if path.exists() {
        let contents = fs::read_to_string(&path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        Ok(config)
    } else {
        Ok(Config::default())
    }
}

pub fn save_config(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    save_config_to(config, config_path())
}

pub fn save_config_to(config: &Config, path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let contents = serde_yaml::to_string(config)?;
    fs::write(path, contents)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_from(dir.path().join("absent.yml")).unwrap();
        assert_eq!(config.reddit.api_host, "oauth.reddit.com");
        assert_eq!(config.reddit.token_url, DEFAULT_TOKEN_URL);
        assert_eq!(config.reddit.timeout_secs, 30);
        assert!(config.reddit.credentials().is_none());
    }

    #[test]
    fn partial_file_keeps_defaults_for_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        fs::write(&path, "reddit:\n  client_id: abc\n  client_secret: xyz\n  timeout_secs: 5\n").unwrap();

        let config = load_config_from(path).unwrap();
        assert_eq!(config.reddit.timeout_secs, 5);
        assert_eq!(config.reddit.link_pattern, default_link_pattern());
        let creds = config.reddit.credentials().unwrap();
        assert_eq!(creds.client_id, "abc");
        assert_eq!(creds.client_secret, "xyz");
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.yml");
        let mut config = Config::default();
        config.ffmpeg.path = Some("/opt/ffmpeg/bin/ffmpeg".into());
        save_config_to(&config, path.clone()).unwrap();

        let loaded = load_config_from(path).unwrap();
        assert_eq!(loaded.ffmpeg.path.as_deref(), Some("/opt/ffmpeg/bin/ffmpeg"));
    }

    #[test]
    fn environment_overrides_file_values() {
        let vars: HashMap<&str, &str> = [
            (CLIENT_ID_ENV, "env-id"),
            (CLIENT_SECRET_ENV, "env-secret"),
            (USER_AGENT_ENV, ""),
        ]
        .into_iter()
        .collect();

        let config = Config::default().with_overrides(|key| vars.get(key).map(|v| v.to_string()));
        let creds = config.reddit.credentials().unwrap();
        assert_eq!(creds.client_id, "env-id");
        assert_eq!(creds.client_secret, "env-secret");
        assert_eq!(config.reddit.user_agent, default_user_agent());
    }

    #[test]
    fn empty_credentials_mean_anonymous() {
        let config = RedditConfig {
            client_id: Some(String::new()),
            client_secret: Some("secret".into()),
            ..RedditConfig::default()
        };
        assert!(config.credentials().is_none());
    }
}
