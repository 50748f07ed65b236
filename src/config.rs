use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::{fs, path::Path, time::Duration};
use url::Url;

pub const DEFAULT_CONFIG_FILE: &str = "config.toml";

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub listen: ListenConfig,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub keys: KeysConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ListenConfig {
    pub ip: String,
    pub port: u16,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    pub allowed_ips: Option<Vec<String>>,
    /// Peers whose `X-Forwarded-For` header is believed when attributing
    /// requests. Unset trusts no one.
    pub trusted_proxies: Option<Vec<String>>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct UpstreamConfig {
    /// JSON-RPC over HTTP(S), e.g. `http://127.0.0.1:8545`.
    pub http: String,
    /// JSON-RPC over WebSocket, e.g. `ws://127.0.0.1:8546`.
    pub ws: String,
    /// Bounds the wait for upstream response headers. Streamed bodies are
    /// not cut off.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_dial_timeout_secs")]
    pub dial_timeout_secs: u64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct KeysConfig {
    #[serde(default = "default_keys_file")]
    pub file: String,
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            file: default_keys_file(),
        }
    }
}

fn default_path() -> String {
    "/geth".to_string()
}

fn default_keys_file() -> String {
    "./keys.txt".to_string()
}

const fn default_handshake_timeout_secs() -> u64 {
    45
}

const fn default_request_timeout_secs() -> u64 {
    30
}

const fn default_dial_timeout_secs() -> u64 {
    45
}

impl ListenConfig {
    #[must_use]
    pub fn addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

impl UpstreamConfig {
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    #[must_use]
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }
}

impl Config {
    /// Rejects upstream URLs with the wrong scheme and endpoint paths that
    /// can never match a request line.
    pub fn validate(&self) -> Result<()> {
        let http = Url::parse(&self.upstream.http)
            .with_context(|| format!("Invalid upstream.http URL: {}", self.upstream.http))?;
        if !matches!(http.scheme(), "http" | "https") {
            bail!("upstream.http must use http or https, got {}", http.scheme());
        }

        let ws = Url::parse(&self.upstream.ws)
            .with_context(|| format!("Invalid upstream.ws URL: {}", self.upstream.ws))?;
        if !matches!(ws.scheme(), "ws" | "wss") {
            bail!("upstream.ws must use ws or wss, got {}", ws.scheme());
        }

        if !self.listen.path.starts_with('/') {
            bail!("listen.path must start with '/', got {}", self.listen.path);
        }

        Ok(())
    }
}

pub fn load_config() -> Result<Config> {
    load_config_from(DEFAULT_CONFIG_FILE)
}

pub fn load_config_from(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {} file", path.display()))?;
    parse_config(&content)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config =
        toml::from_str(content).context("Failed to parse configuration as valid TOML")?;
    config.validate()?;
    Ok(config)
}
