//! Runtime configuration
//!
//! Configuration is a YAML document whose every field has a default, so an
//! empty file (or no file at all) yields a working setup. The `LISTEN`
//! environment variable overrides the listen address.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Environment variable naming the YAML config file
pub const CONFIG_ENV: &str = "STREAMGATE_CONFIG";

/// Environment variable overriding `server.listen_addr`
pub const LISTEN_ENV: &str = "LISTEN";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub signaling: SignalingConfig,
    pub http: HttpConfig,
    pub media: MediaConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
        }
    }
}

/// Outbound leg of the signaling proxy
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Internal WebSocket endpoint (e.g. "wss://127.0.0.1:47991")
    pub upstream_url: String,
    pub connect_timeout_secs: u64,
    pub ping_interval_secs: u64,
    pub ping_timeout_secs: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            upstream_url: "wss://127.0.0.1:47991".to_string(),
            connect_timeout_secs: 10,
            ping_interval_secs: 20,
            ping_timeout_secs: 20,
        }
    }
}

impl SignalingConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }
}

/// HTTP forwarding to the internal HTTPS endpoint
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Scheme, host and port of the internal endpoint, no trailing path
    pub upstream_url: String,
    pub request_timeout_secs: u64,
    /// Origins allowed to embed proxied pages in a frame
    pub frame_ancestors: Vec<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            upstream_url: "https://127.0.0.1:47990".to_string(),
            request_timeout_secs: 30,
            frame_ancestors: vec!["'self'".to_string()],
        }
    }
}

impl HttpConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Capture settings for the fragmented MP4 producer
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub program: String,
    pub display: String,
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    pub encoder: String,
    pub bitrate: String,
    pub fragment_duration_us: u64,
    pub read_chunk_size: usize,
    /// Boxes queued per subscriber before it is considered stalled
    pub subscriber_queue: usize,
    /// Largest box accepted from the producer
    pub max_box_size: u64,
    pub idle_ping_secs: u64,
    /// Replaces the generated argument list entirely when set
    pub extra_args: Option<Vec<String>>,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            program: "ffmpeg".to_string(),
            display: ":99".to_string(),
            width: 1920,
            height: 1080,
            framerate: 30,
            encoder: "libx264".to_string(),
            bitrate: "2M".to_string(),
            fragment_duration_us: 100_000,
            read_chunk_size: 64 * 1024,
            subscriber_queue: 256,
            max_box_size: 64 * 1024 * 1024,
            idle_ping_secs: 30,
            extra_args: None,
        }
    }
}

impl MediaConfig {
    pub fn idle_ping(&self) -> Duration {
        Duration::from_secs(self.idle_ping_secs)
    }
}

impl Config {
    /// Load configuration from `STREAMGATE_CONFIG` (if set), then apply
    /// environment overrides.
    pub fn load() -> Result<Self> {
        let mut cfg = match std::env::var(CONFIG_ENV) {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };

        if let Ok(listen) = std::env::var(LISTEN_ENV) {
            cfg.server.listen_addr = listen;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_yaml_str(&text)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        // An empty document deserializes to unit, not to an empty map
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        let cfg: Config = serde_yaml::from_str(text).context("Failed to parse YAML")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject upstream URLs that cannot be used for their leg.
    pub fn validate(&self) -> Result<()> {
        let signaling = url::Url::parse(&self.signaling.upstream_url)
            .context("Invalid signaling.upstream_url")?;
        if !matches!(signaling.scheme(), "ws" | "wss") {
            anyhow::bail!(
                "signaling.upstream_url must use ws or wss, got {}",
                signaling.scheme()
            );
        }

        let http = url::Url::parse(&self.http.upstream_url)
            .context("Invalid http.upstream_url")?;
        if !matches!(http.scheme(), "http" | "https") {
            anyhow::bail!(
                "http.upstream_url must use http or https, got {}",
                http.scheme()
            );
        }
        if http.host_str().is_none() {
            anyhow::bail!("http.upstream_url is missing a host");
        }

        let durations = [
            ("signaling.connect_timeout_secs", self.signaling.connect_timeout_secs),
            ("signaling.ping_interval_secs", self.signaling.ping_interval_secs),
            ("signaling.ping_timeout_secs", self.signaling.ping_timeout_secs),
            ("http.request_timeout_secs", self.http.request_timeout_secs),
            ("media.idle_ping_secs", self.media.idle_ping_secs),
        ];
        for (name, secs) in durations {
            if secs == 0 {
                anyhow::bail!("{name} must be at least 1");
            }
        }

        if self.media.subscriber_queue == 0 {
            anyhow::bail!("media.subscriber_queue must be at least 1");
        }
        if self.media.read_chunk_size == 0 {
            anyhow::bail!("media.read_chunk_size must be at least 1");
        }

        Ok(())
    }
}
