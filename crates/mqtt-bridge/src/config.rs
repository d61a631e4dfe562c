use anyhow::{bail, Context};
use reqwest::Url;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub event_bus: EventBusConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
pub struct BridgeConfig {
    /// Source id stamped on every outbound event. Has no default.
    #[serde(default)]
    pub application_name: String,
    #[serde(default = "default_listen")]
    pub listen_addr: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            application_name: String::new(),
            listen_addr: default_listen(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct EventBusConfig {
    #[serde(default = "default_event_url")]
    pub url: String,
    #[serde(default = "default_event_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_inflight")]
    pub max_inflight_per_connection: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            url: default_event_url(),
            timeout_secs: default_event_timeout(),
            max_inflight_per_connection: default_max_inflight(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub oauth_url: Option<String>,
    #[serde(default = "default_auth_timeout")]
    pub timeout_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            oauth_url: None,
            timeout_secs: default_auth_timeout(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            max_packet_size: default_max_packet_size(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// ---------------------------------------------------------------------------
// Default-value functions used by serde
// ---------------------------------------------------------------------------

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_event_url() -> String {
    "http://event-bus-publish.kyma-system.svc.cluster.local:8080/v1/events".to_string()
}

fn default_event_timeout() -> u64 {
    10
}

fn default_max_inflight() -> usize {
    1
}

fn default_auth_timeout() -> u64 {
    5
}

fn default_max_packet_size() -> usize {
    mqtt_wire::DEFAULT_MAX_PACKET_SIZE
}

fn default_log_level() -> String {
    "info".to_string()
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Configuration checked and parsed into the types the bridge runs with.
#[derive(Debug)]
pub struct Settings {
    pub application_name: String,
    pub listen_addr: SocketAddr,
    pub event_url: Url,
    pub event_timeout: Duration,
    pub max_inflight: usize,
    /// `None` disables token validation.
    pub oauth_url: Option<Url>,
    pub auth_timeout: Duration,
    pub max_packet_size: usize,
    pub log_level: String,
}

impl Config {
    pub fn resolve(self) -> anyhow::Result<Settings> {
        let application_name = self.bridge.application_name.trim().to_string();
        if application_name.is_empty() {
            bail!("bridge.application_name is required (set APPLICATION_NAME or --application-name)");
        }

        let listen_addr: SocketAddr = self
            .bridge
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address '{}'", self.bridge.listen_addr))?;

        let event_url = parse_http_url("event_bus.url", &self.event_bus.url)?;

        let oauth_url = match self.auth.oauth_url.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(parse_http_url("auth.oauth_url", raw)?),
        };

        if self.event_bus.max_inflight_per_connection == 0 {
            bail!("event_bus.max_inflight_per_connection must be at least 1");
        }
        if self.mqtt.max_packet_size == 0 {
            bail!("mqtt.max_packet_size must be at least 1");
        }
        if self.event_bus.timeout_secs == 0 || self.auth.timeout_secs == 0 {
            bail!("request timeouts must be at least one second");
        }

        Ok(Settings {
            application_name,
            listen_addr,
            event_url,
            event_timeout: Duration::from_secs(self.event_bus.timeout_secs),
            max_inflight: self.event_bus.max_inflight_per_connection,
            oauth_url,
            auth_timeout: Duration::from_secs(self.auth.timeout_secs),
            max_packet_size: self.mqtt.max_packet_size,
            log_level: self.logging.level,
        })
    }
}

fn parse_http_url(key: &str, raw: &str) -> anyhow::Result<Url> {
    let url = Url::parse(raw).with_context(|| format!("{key} is not a valid URL: '{raw}'"))?;
    if !matches!(url.scheme(), "http" | "https") {
        bail!("{key} must be an http(s) URL, got '{raw}'");
    }
    Ok(url)
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Where a loaded [`Config`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    File,
    /// The file was absent and every setting is a default.
    Defaults,
}

/// Load configuration from a YAML file.
///
/// A missing file is not an error: defaults are returned together with
/// [`ConfigSource::Defaults`] so the caller can warn once logging is up, and
/// the bridge can run from environment variables alone.
pub fn load(path: &Path) -> anyhow::Result<(Config, ConfigSource)> {
    if !path.exists() {
        return Ok((Config::default(), ConfigSource::Defaults));
    }

    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config file {}: {e}", path.display()))?;

    let config: Config = serde_yml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("failed to parse config file {}: {e}", path.display()))?;

    Ok((config, ConfigSource::File))
}
