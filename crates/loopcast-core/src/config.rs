use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::platform;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub playback: PlaybackConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Where track files come from.  Exactly one source is used: a local
/// directory when set, otherwise the upstream object store the gateway
/// proxies (forwarding Range headers so seeks stay cheap).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    #[serde(default = "default_upstream_base_url")]
    pub upstream_base_url: String,
    #[serde(default)]
    pub local_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Path to a JSON metadata array (highest priority).
    /// Falls back to the builtin day-N catalog when absent.
    #[serde(default = "default_tracks_json")]
    pub tracks_json: PathBuf,
    /// Size of the builtin catalog when no metadata file exists.
    #[serde(default = "default_track_count")]
    pub track_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    #[serde(default = "default_volume")]
    pub default_volume: f32,
    /// Liveness tolerance in seconds (|actual - live| below this is "live").
    #[serde(default = "default_live_threshold")]
    pub live_threshold_secs: f64,
    /// Bounded retry budget for recoverable playback errors.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// When false, the ended-track handler honours shuffle/repeat instead of
    /// catalog order and playback never auto-joins the live edge.
    #[serde(default = "default_virtual_live")]
    pub virtual_live: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_http_enabled(),
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            upstream_base_url: default_upstream_base_url(),
            local_dir: None,
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            tracks_json: default_tracks_json(),
            track_count: default_track_count(),
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            default_volume: default_volume(),
            live_threshold_secs: default_live_threshold(),
            max_retries: default_max_retries(),
            virtual_live: default_virtual_live(),
        }
    }
}

fn default_state_file() -> PathBuf {
    platform::data_dir().join("state.json")
}

fn default_http_enabled() -> bool {
    true
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8991
}

fn default_upstream_base_url() -> String {
    "https://pub-525228169e0c44e38a67c306ba1a458c.r2.dev".to_string()
}

fn default_tracks_json() -> PathBuf {
    platform::config_dir().join("tracks.json")
}

fn default_track_count() -> usize {
    40
}

fn default_volume() -> f32 {
    0.8
}

fn default_live_threshold() -> f64 {
    5.0
}

fn default_max_retries() -> u32 {
    3
}

fn default_virtual_live() -> bool {
    true
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&config_path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.http.enabled);
        assert_eq!(config.http.port, 8991);
        assert_eq!(config.http.bind_address, "127.0.0.1");
        assert_eq!(config.catalog.track_count, 40);
        assert_eq!(config.playback.live_threshold_secs, 5.0);
        assert_eq!(config.playback.max_retries, 3);
        assert!(config.playback.virtual_live);
        assert!(config.audio.upstream_base_url.starts_with("https://"));
        assert!(config.catalog.tracks_json.ends_with("loopcast/tracks.json"));
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [http]
            port = 9000
            "#,
        )
        .unwrap();
        assert_eq!(config.http.port, 9000);
        assert!(config.http.enabled);
        assert_eq!(config.playback.default_volume, 0.8);
        assert!(config.audio.local_dir.is_none());
    }
}
