//! Configuration resolution for `StreamRelay`.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (`~/.config/streamrelay/settings.json`)
//! 3. Explicit config file (`--config`)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Default size of a single read from the child's output or error pipe.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 32 * 1024;

/// Default size of the chunks a reader-backed source hands to the relay.
pub const DEFAULT_SOURCE_CHUNK_SIZE: usize = 32 * 1024;

/// Default grace period between SIGTERM and SIGKILL when aborting a relay.
pub const DEFAULT_TERMINATE_GRACE_MS: u64 = 5_000;

/// Complete `StreamRelay` configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub relay: RelaySettings,
}

/// How captured child output is turned into text at the boundary.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DecodeMode {
    /// Reject captured output that is not valid UTF-8.
    Strict,
    /// Replace invalid UTF-8 sequences with U+FFFD.
    #[default]
    Lossy,
    /// Hand the captured bytes through untouched.
    Raw,
}

impl std::str::FromStr for DecodeMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "lossy" => Ok(Self::Lossy),
            "raw" => Ok(Self::Raw),
            other => Err(Error::Config(format!("Unknown decode mode: {other}"))),
        }
    }
}

/// Relay engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RelaySettings {
    /// Bytes requested per read from the child's output/error pipes.
    pub read_buffer_size: usize,
    /// Bytes per chunk when the payload comes from a plain reader.
    pub source_chunk_size: usize,
    /// Milliseconds to wait after SIGTERM before SIGKILL on abort.
    pub terminate_grace_ms: u64,
    /// Overall relay deadline in seconds. `None` waits forever.
    pub timeout_secs: Option<u64>,
    /// Decode policy for captured output.
    pub decode: DecodeMode,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            source_chunk_size: DEFAULT_SOURCE_CHUNK_SIZE,
            terminate_grace_ms: DEFAULT_TERMINATE_GRACE_MS,
            timeout_secs: None,
            decode: DecodeMode::default(),
        }
    }
}

impl RelaySettings {
    /// Reject settings the relay cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.read_buffer_size == 0 {
            return Err(Error::Config("read_buffer_size must be non-zero".into()));
        }
        if self.source_chunk_size == 0 {
            return Err(Error::Config("source_chunk_size must be non-zero".into()));
        }
        if self.timeout_secs == Some(0) {
            return Err(Error::Config("timeout_secs must be non-zero when set".into()));
        }
        Ok(())
    }
}

/// A config file layer: every field optional so absent keys keep the
/// value resolved from lower-priority layers.
#[derive(Debug, Default, Deserialize)]
struct ConfigLayer {
    #[serde(default)]
    relay: RelayLayer,
}

#[derive(Debug, Default, Deserialize)]
struct RelayLayer {
    read_buffer_size: Option<usize>,
    source_chunk_size: Option<usize>,
    terminate_grace_ms: Option<u64>,
    timeout_secs: Option<u64>,
    decode: Option<DecodeMode>,
}

/// Load configuration with hierarchical resolution.
///
/// `explicit` is a file the caller named directly; unlike the global file
/// it must exist.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        let global = load_config_file(&global_path)?;
        merge_layer(&mut config, global);
    }

    if let Some(path) = explicit {
        let layer = load_config_file(path)?;
        merge_layer(&mut config, layer);
    }

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config.relay.validate()?;

    Ok(config)
}

/// Get the global config file path (`<config dir>/streamrelay/settings.json`).
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("streamrelay").join("settings.json"))
}

fn load_config_file(path: &Path) -> Result<ConfigLayer> {
    let content = std::fs::read_to_string(path).map_err(|source| Error::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| Error::Json {
        path: path.to_path_buf(),
        source,
    })
}

fn merge_layer(base: &mut Config, overlay: ConfigLayer) {
    let relay = overlay.relay;
    if let Some(n) = relay.read_buffer_size {
        base.relay.read_buffer_size = n;
    }
    if let Some(n) = relay.source_chunk_size {
        base.relay.source_chunk_size = n;
    }
    if let Some(ms) = relay.terminate_grace_ms {
        base.relay.terminate_grace_ms = ms;
    }
    if relay.timeout_secs.is_some() {
        base.relay.timeout_secs = relay.timeout_secs;
    }
    if let Some(mode) = relay.decode {
        base.relay.decode = mode;
    }
}

/// Apply `STREAMRELAY_*` overrides, reading variables through `lookup`.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(val) = lookup("STREAMRELAY_READ_BUFFER_SIZE") {
        match val.parse() {
            Ok(n) => config.relay.read_buffer_size = n,
            Err(_) => tracing::warn!(value = %val, "Ignoring invalid STREAMRELAY_READ_BUFFER_SIZE"),
        }
    }
    if let Some(val) = lookup("STREAMRELAY_SOURCE_CHUNK_SIZE") {
        match val.parse() {
            Ok(n) => config.relay.source_chunk_size = n,
            Err(_) => tracing::warn!(value = %val, "Ignoring invalid STREAMRELAY_SOURCE_CHUNK_SIZE"),
        }
    }
    if let Some(val) = lookup("STREAMRELAY_TERMINATE_GRACE_MS") {
        match val.parse() {
            Ok(ms) => config.relay.terminate_grace_ms = ms,
            Err(_) => tracing::warn!(value = %val, "Ignoring invalid STREAMRELAY_TERMINATE_GRACE_MS"),
        }
    }
    if let Some(val) = lookup("STREAMRELAY_TIMEOUT_SECS") {
        match val.parse() {
            Ok(secs) => config.relay.timeout_secs = Some(secs),
            Err(_) => tracing::warn!(value = %val, "Ignoring invalid STREAMRELAY_TIMEOUT_SECS"),
        }
    }
    if let Some(val) = lookup("STREAMRELAY_DECODE") {
        match val.parse() {
            Ok(mode) => config.relay.decode = mode,
            Err(_) => tracing::warn!(value = %val, "Ignoring invalid STREAMRELAY_DECODE"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_uses_32k_buffers() {
        let config = Config::default();
        assert_eq!(config.relay.read_buffer_size, 32 * 1024);
        assert_eq!(config.relay.source_chunk_size, 32 * 1024);
        assert_eq!(config.relay.timeout_secs, None);
        assert_eq!(config.relay.decode, DecodeMode::Lossy);
    }

    #[test]
    fn layer_only_overrides_present_keys() {
        let mut config = Config::default();
        let layer: ConfigLayer =
            serde_json::from_str(r#"{"relay": {"timeout_secs": 30, "decode": "strict"}}"#).unwrap();
        merge_layer(&mut config, layer);

        assert_eq!(config.relay.timeout_secs, Some(30));
        assert_eq!(config.relay.decode, DecodeMode::Strict);
        assert_eq!(config.relay.read_buffer_size, DEFAULT_READ_BUFFER_SIZE);
        assert_eq!(config.relay.terminate_grace_ms, DEFAULT_TERMINATE_GRACE_MS);
    }

    #[test]
    fn explicit_file_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"relay": {"source_chunk_size": 4096}}"#).unwrap();

        let layer = load_config_file(&path).unwrap();
        let mut config = Config::default();
        merge_layer(&mut config, layer);
        assert_eq!(config.relay.source_chunk_size, 4096);
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.json");
        let err = load_config_file(&missing).unwrap_err();
        assert!(matches!(&err, Error::Io { path, .. } if *path == missing));
        assert!(err.to_string().contains("nope.json"));
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = load_config_file(&path).unwrap_err();
        assert!(matches!(err, Error::Json { .. }));
        assert!(err.to_string().contains("Failed to parse"));
    }

    #[test]
    fn env_overrides_apply_and_bad_values_are_ignored() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("STREAMRELAY_READ_BUFFER_SIZE", "8192"),
            ("STREAMRELAY_TIMEOUT_SECS", "12"),
            ("STREAMRELAY_DECODE", "raw"),
            ("STREAMRELAY_TERMINATE_GRACE_MS", "soon"),
        ]);
        let mut config = Config::default();
        apply_env_overrides(&mut config, |k| vars.get(k).map(|v| (*v).to_string()));

        assert_eq!(config.relay.read_buffer_size, 8192);
        assert_eq!(config.relay.timeout_secs, Some(12));
        assert_eq!(config.relay.decode, DecodeMode::Raw);
        assert_eq!(config.relay.terminate_grace_ms, DEFAULT_TERMINATE_GRACE_MS);
    }

    #[test]
    fn validate_rejects_zero_sizes() {
        let mut settings = RelaySettings::default();
        assert!(settings.validate().is_ok());

        settings.read_buffer_size = 0;
        assert!(settings.validate().is_err());

        settings = RelaySettings {
            timeout_secs: Some(0),
            ..RelaySettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn decode_mode_parses_case_insensitively() {
        assert_eq!("STRICT".parse::<DecodeMode>().unwrap(), DecodeMode::Strict);
        assert!("utf16".parse::<DecodeMode>().is_err());
    }
}
