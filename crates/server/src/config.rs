use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::probe::DEFAULT_LINE_BUFFER;

const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");
const DEFAULT_BIND: &str = "0.0.0.0:8000";
const DEFAULT_PROBE_TIMEOUT: &str = "5m";
const DEFAULT_RATE_WINDOW: &str = "5s";
const DEFAULT_RATE_THRESHOLD: u32 = 5;

#[derive(Debug, Default, Deserialize)]
pub(crate) struct Config {
    #[serde(default)]
    pub(crate) server: ServerConfig,
    #[serde(default)]
    pub(crate) site: SiteSettings,
    #[serde(default)]
    pub(crate) limits: LimitsConfig,
    #[serde(default)]
    pub(crate) session: SessionConfig,
    #[serde(default)]
    pub(crate) probes: ProbesConfig,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ServerConfig {
    #[serde(default = "default_bind")]
    pub(crate) bind: String,
    #[serde(default)]
    pub(crate) trust_proxy_headers: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            trust_proxy_headers: false,
        }
    }
}

/// Presentation settings handed to the page renderer as-is.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct SiteSettings {
    #[serde(default)]
    pub(crate) title: String,
    #[serde(default)]
    pub(crate) page_header: String,
    #[serde(default)]
    pub(crate) server_location: String,
    #[serde(default)]
    pub(crate) ip_address: Vec<LabeledValue>,
    #[serde(default)]
    pub(crate) links: Vec<SiteLink>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct LabeledValue {
    pub(crate) label: String,
    pub(crate) value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SiteLink {
    pub(crate) title: String,
    pub(crate) href: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LimitsConfig {
    #[serde(default = "default_probe_timeout")]
    pub(crate) probe_timeout: String,
    #[serde(default = "default_rate_window")]
    pub(crate) rate_window: String,
    #[serde(default = "default_rate_threshold")]
    pub(crate) rate_threshold: u32,
    #[serde(default = "default_line_buffer")]
    pub(crate) line_buffer_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            probe_timeout: default_probe_timeout(),
            rate_window: default_rate_window(),
            rate_threshold: DEFAULT_RATE_THRESHOLD,
            line_buffer_bytes: DEFAULT_LINE_BUFFER,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct SessionConfig {
    #[serde(default)]
    pub(crate) notify_rate_limited: bool,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ProbesConfig {
    /// Tool name to executable path, e.g. `traceroute = "/usr/sbin/traceroute"`.
    #[serde(default)]
    pub(crate) programs: BTreeMap<String, String>,
}

/// Limits with durations parsed and values checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Limits {
    pub(crate) probe_timeout: Duration,
    pub(crate) rate_window: Duration,
    pub(crate) rate_threshold: u32,
    pub(crate) line_buffer_bytes: usize,
}

impl LimitsConfig {
    pub(crate) fn resolve(&self) -> anyhow::Result<Limits> {
        let probe_timeout = humantime::parse_duration(&self.probe_timeout)
            .with_context(|| format!("invalid limits.probe_timeout {:?}", self.probe_timeout))?;
        let rate_window = humantime::parse_duration(&self.rate_window)
            .with_context(|| format!("invalid limits.rate_window {:?}", self.rate_window))?;
        if probe_timeout.is_zero() {
            anyhow::bail!("limits.probe_timeout must be greater than zero");
        }
        if self.rate_threshold == 0 {
            anyhow::bail!("limits.rate_threshold must be at least 1");
        }
        if self.line_buffer_bytes == 0 {
            anyhow::bail!("limits.line_buffer_bytes must be at least 1");
        }
        Ok(Limits {
            probe_timeout,
            rate_window,
            rate_threshold: self.rate_threshold,
            line_buffer_bytes: self.line_buffer_bytes,
        })
    }
}

impl Config {
    pub(crate) fn parse(raw: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(raw)?;
        config.limits.resolve()?;
        Ok(config)
    }

    /// Reads the config, first writing the bundled default if the file does
    /// not exist yet.
    pub(crate) fn load_or_create(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            std::fs::write(path, DEFAULT_CONFIG)
                .with_context(|| format!("failed to write default config {}", path.display()))?;
            tracing::warn!(
                event = "config.created",
                path = %path.display(),
                "created default config"
            );
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("failed to parse config {}", path.display()))
    }
}

fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}

fn default_probe_timeout() -> String {
    DEFAULT_PROBE_TIMEOUT.to_string()
}

fn default_rate_window() -> String {
    DEFAULT_RATE_WINDOW.to_string()
}

fn default_rate_threshold() -> u32 {
    DEFAULT_RATE_THRESHOLD
}

fn default_line_buffer() -> usize {
    DEFAULT_LINE_BUFFER
}
