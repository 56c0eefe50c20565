//! Persistent lookup configuration model, defaults, and loading.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::info;

use crate::error::ConfigError;

const CONFIG_FILE_NAME: &str = "artist_bio_batcher.toml";
/// Largest artist list the batch endpoint accepts in one request.
pub const ENDPOINT_MAX_BATCH_SIZE: usize = 30;

/// Root configuration persisted to `artist_bio_batcher.toml`.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Config {
    #[serde(default)]
    /// Batch endpoint location and transport settings.
    pub endpoint: EndpointConfig,
    #[serde(default)]
    /// Debounce, chunking, and caching behavior.
    pub batching: BatchingConfig,
}

/// Batch endpoint location and transport settings.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct EndpointConfig {
    #[serde(default = "default_endpoint_url")]
    pub url: String,
    /// Wikipedia language edition requested from the endpoint.
    #[serde(default = "default_lang")]
    pub lang: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    /// Extra request headers supplied by the host (auth, CSRF).
    #[serde(default)]
    pub extra_headers: BTreeMap<String, String>,
}

/// Debounce, chunking, and caching behavior.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct BatchingConfig {
    /// Debounce window between the first queued key and the batch flush.
    #[serde(default = "default_flush_delay_ms")]
    pub flush_delay_ms: u64,
    #[serde(default = "default_prefetch_chunk_size")]
    pub prefetch_chunk_size: usize,
    /// Upper bound on keys per network call, for flushes and prefetches alike.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// How long a failed key keeps serving its fallback. `0` retries on the next lookup.
    #[serde(default)]
    pub failure_ttl_secs: u64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            url: default_endpoint_url(),
            lang: default_lang(),
            user_agent: default_user_agent(),
            connect_timeout_secs: default_connect_timeout_secs(),
            read_timeout_secs: default_read_timeout_secs(),
            extra_headers: BTreeMap::new(),
        }
    }
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            flush_delay_ms: default_flush_delay_ms(),
            prefetch_chunk_size: default_prefetch_chunk_size(),
            max_batch_size: default_max_batch_size(),
            failure_ttl_secs: 0,
        }
    }
}

impl BatchingConfig {
    pub fn flush_delay(&self) -> Duration {
        Duration::from_millis(self.flush_delay_ms)
    }

    pub fn failure_ttl(&self) -> Duration {
        Duration::from_secs(self.failure_ttl_secs)
    }
}

fn default_endpoint_url() -> String {
    "http://127.0.0.1:8000/api/wikipedia/artists/".to_string()
}

fn default_lang() -> String {
    "ru".to_string()
}

fn default_user_agent() -> String {
    format!("artist_bio_batcher/{}", env!("CARGO_PKG_VERSION"))
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_read_timeout_secs() -> u64 {
    7
}

fn default_flush_delay_ms() -> u64 {
    80
}

fn default_prefetch_chunk_size() -> usize {
    12
}

fn default_max_batch_size() -> usize {
    ENDPOINT_MAX_BATCH_SIZE
}

/// Clamps loaded values into ranges the endpoint and batcher accept.
pub fn sanitize_config(config: Config) -> Config {
    let max_batch_size = config.batching.max_batch_size.clamp(1, ENDPOINT_MAX_BATCH_SIZE);
    let prefetch_chunk_size = config.batching.prefetch_chunk_size.clamp(1, max_batch_size);
    let flush_delay_ms = config.batching.flush_delay_ms.min(5_000);
    let lang = config.endpoint.lang.trim().to_ascii_lowercase();
    let lang_valid =
        !lang.is_empty() && lang.len() <= 5 && lang.chars().all(|ch| ch.is_ascii_alphabetic());
    let lang = if lang_valid { lang } else { default_lang() };

    Config {
        endpoint: EndpointConfig {
            url: config.endpoint.url.trim().to_string(),
            lang,
            connect_timeout_secs: config.endpoint.connect_timeout_secs.max(1),
            read_timeout_secs: config.endpoint.read_timeout_secs.max(1),
            ..config.endpoint
        },
        batching: BatchingConfig {
            flush_delay_ms,
            prefetch_chunk_size,
            max_batch_size,
            failure_ttl_secs: config.batching.failure_ttl_secs,
        },
    }
}

/// Default location of the config file, if the platform has a config directory.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(CONFIG_FILE_NAME))
}

/// Reads `path`, writing a default config there first if it does not exist.
pub fn load_or_create_config(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        info!(
            "Config file not found. Creating default config. path={}",
            path.display()
        );
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string(&Config::default())?)?;
    }

    let content = std::fs::read_to_string(path)?;
    let config = toml::from_str::<Config>(&content)?;
    Ok(sanitize_config(config))
}

#[cfg(test)]
mod tests {
    use super::{load_or_create_config, sanitize_config, Config, ENDPOINT_MAX_BATCH_SIZE};

    fn scratch_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir()
            .join(format!("artist_bio_batcher_{}_{}", std::process::id(), name))
            .join("config.toml")
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [batching]
            flush_delay_ms = 20
            "#,
        )
        .expect("partial config should parse");
        assert_eq!(config.batching.flush_delay_ms, 20);
        assert_eq!(config.batching.prefetch_chunk_size, 12);
        assert_eq!(config.batching.max_batch_size, ENDPOINT_MAX_BATCH_SIZE);
        assert_eq!(config.endpoint.lang, "ru");
        assert_eq!(config.batching.failure_ttl_secs, 0);
    }

    #[test]
    fn test_sanitize_clamps_chunk_sizes_and_lang() {
        let mut config = Config::default();
        config.batching.max_batch_size = 500;
        config.batching.prefetch_chunk_size = 0;
        config.endpoint.lang = "not-a-lang".to_string();
        let sanitized = sanitize_config(config);
        assert_eq!(sanitized.batching.max_batch_size, ENDPOINT_MAX_BATCH_SIZE);
        assert_eq!(sanitized.batching.prefetch_chunk_size, 1);
        assert_eq!(sanitized.endpoint.lang, "ru");

        let mut config = Config::default();
        config.batching.max_batch_size = 8;
        config.batching.prefetch_chunk_size = 12;
        config.endpoint.lang = " EN ".to_string();
        let sanitized = sanitize_config(config);
        assert_eq!(sanitized.batching.prefetch_chunk_size, 8);
        assert_eq!(sanitized.endpoint.lang, "en");
    }

    #[test]
    fn test_load_or_create_writes_default_file() {
        let path = scratch_path("create");
        let _ = std::fs::remove_file(&path);
        let config = load_or_create_config(&path).expect("default config should load");
        assert_eq!(config, sanitize_config(Config::default()));
        assert!(path.exists());

        std::fs::write(
            &path,
            "[endpoint]\nurl = \"http://example.test/bios/\"\nlang = \"en\"\n",
        )
        .expect("config should be writable");
        let config = load_or_create_config(&path).expect("edited config should load");
        assert_eq!(config.endpoint.url, "http://example.test/bios/");
        assert_eq!(config.endpoint.lang, "en");
        let _ = std::fs::remove_dir_all(path.parent().expect("scratch dir"));
    }

    #[test]
    fn test_load_rejects_malformed_toml() {
        let path = scratch_path("malformed");
        std::fs::create_dir_all(path.parent().expect("scratch dir")).expect("mkdir");
        std::fs::write(&path, "[batching\nflush_delay_ms = ").expect("write");
        assert!(load_or_create_config(&path).is_err());
        let _ = std::fs::remove_dir_all(path.parent().expect("scratch dir"));
    }
}
