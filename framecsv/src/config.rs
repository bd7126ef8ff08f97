//! Profiler configuration, loadable from TOML.

use serde::Deserialize;
use std::path::Path;

fn default_process_interval_ms() -> u64 {
    10
}

fn default_lookahead_frames() -> u32 {
    3
}

fn default_write_buffer_size() -> usize {
    128 * 1024
}

fn default_compression_level() -> i32 {
    3
}

fn default_true() -> bool {
    true
}

fn default_stall_growth_passes() -> u32 {
    3
}

fn default_stall_block_passes() -> u32 {
    2
}

fn default_drain_slack_bytes() -> i64 {
    512 * 1024
}

/// Whether capture output is compressed: never, always, or per the
/// individual capture request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionMode {
    Off,
    #[default]
    AsRequested,
    On,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProfilerConfig {
    /// Sleep between processing passes, in milliseconds.
    #[serde(default = "default_process_interval_ms")]
    pub process_interval_ms: u64,
    /// Frames withheld from finalization to tolerate cross-thread
    /// attribution skew.
    #[serde(default = "default_lookahead_frames")]
    pub lookahead_frames: u32,
    #[serde(default = "default_write_buffer_size")]
    pub write_buffer_size: usize,
    #[serde(default)]
    pub compression: CompressionMode,
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,
    /// Categories disabled at registration time; may be re-enabled at
    /// runtime.
    #[serde(default)]
    pub disabled_categories: Vec<String>,
    #[serde(default = "default_true")]
    pub emit_count_stats: bool,
    /// Fold task-worker series into one shared column per stat.
    #[serde(default = "default_true")]
    pub fold_worker_stats: bool,
    /// Stream rows as the lookahead window allows instead of buffering
    /// everything until capture end.
    #[serde(default = "default_true")]
    pub continuous_streaming: bool,
    /// Run processing synchronously from `end_frame` instead of on a
    /// dedicated thread.
    #[serde(default)]
    pub inline_processing: bool,
    /// Consecutive growing passes before producers are asked to stall.
    #[serde(default = "default_stall_growth_passes")]
    pub stall_growth_passes: u32,
    /// Passes a stalled producer waits out before resuming.
    #[serde(default = "default_stall_block_passes")]
    pub stall_block_passes: u32,
    /// Scratch-vector slack tolerated across drains before trimming;
    /// negative means never trim.
    #[serde(default = "default_drain_slack_bytes")]
    pub drain_slack_bytes: i64,
    /// Recorded in capture metadata for downstream tooling.
    #[serde(default)]
    pub target_framerate: Option<u32>,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty config must deserialize")
    }
}

impl ProfilerConfig {
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn load(path: impl AsRef<Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;
    use std::io::Write;

    #[rstest]
    fn test_defaults() {
        let config = ProfilerConfig::default();
        assert_eq!(config.process_interval_ms, 10);
        assert_eq!(config.lookahead_frames, 3);
        assert_eq!(config.compression, CompressionMode::AsRequested);
        assert!(config.emit_count_stats);
        assert!(config.fold_worker_stats);
        assert!(config.continuous_streaming);
        assert!(!config.inline_processing);
        assert_eq!(config.target_framerate, None);
    }

    #[rstest]
    fn test_parse_full_config() {
        let config = ProfilerConfig::from_toml(
            r#"
            process_interval_ms = 5
            lookahead_frames = 8
            compression = "on"
            compression_level = 9
            disabled_categories = ["Lighting", "Audio"]
            emit_count_stats = false
            continuous_streaming = false
            inline_processing = true
            target_framerate = 60
            "#,
        )
        .unwrap();
        assert_eq!(config.process_interval_ms, 5);
        assert_eq!(config.lookahead_frames, 8);
        assert_eq!(config.compression, CompressionMode::On);
        assert_eq!(config.compression_level, 9);
        assert_eq!(config.disabled_categories, vec!["Lighting", "Audio"]);
        assert!(!config.emit_count_stats);
        assert!(!config.continuous_streaming);
        assert!(config.inline_processing);
        assert_eq!(config.target_framerate, Some(60));
    }

    #[rstest]
    #[case("compression = \"off\"", CompressionMode::Off)]
    #[case("compression = \"as_requested\"", CompressionMode::AsRequested)]
    #[case("compression = \"on\"", CompressionMode::On)]
    fn test_compression_modes(#[case] toml: &str, #[case] expected: CompressionMode) {
        assert_eq!(ProfilerConfig::from_toml(toml).unwrap().compression, expected);
    }

    #[rstest]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "lookahead_frames = 1").unwrap();
        let config = ProfilerConfig::load(file.path()).unwrap();
        assert_eq!(config.lookahead_frames, 1);
    }

    #[rstest]
    fn test_rejects_malformed() {
        assert!(ProfilerConfig::from_toml("lookahead_frames = \"three\"").is_err());
    }
}
