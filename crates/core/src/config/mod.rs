use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{PlayerError, Result};

/// Top-level configuration structure for the player.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub audio: AudioConfig,
    pub analyser: AnalyserConfig,
    pub buffer: BufferConfig,
    pub library: LibraryConfig,
}

impl AppConfig {
    /// Reads a JSON configuration file. Missing sections fall back to their
    /// defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Writes the configuration as pretty-printed JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), text)?;
        Ok(())
    }

    /// Checks the cross-field invariants every stage relies on.
    pub fn validate(&self) -> Result<()> {
        self.audio.validate()?;
        self.analyser.validate()?;
        self.buffer.validate()?;
        if self.library.extension.trim_start_matches('.').is_empty() {
            return Err(PlayerError::config("library extension must not be empty"));
        }
        Ok(())
    }

    /// Number of interleaved samples the output driver should pull per block,
    /// which is exactly what the analyser expects per `read`.
    pub fn block_len(&self) -> usize {
        self.analyser.block_len()
    }
}

/// Fixed sample format of the whole chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    /// Initial gain applied by the gain stage, clamped to `[0, 1]`.
    pub volume: f32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            channels: 2,
            volume: 0.6,
        }
    }
}

impl AudioConfig {
    fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(PlayerError::config("sample rate must be positive"));
        }
        // The analyser downmixes interleaved stereo frames.
        if self.channels != 2 {
            return Err(PlayerError::config(format!(
                "only stereo output is supported, got {} channels",
                self.channels
            )));
        }
        Ok(())
    }
}

/// Parameters of the spectrum analyser stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyserConfig {
    /// Samples per channel in one half of the transform window.
    pub frame_size: usize,
    /// Number of published spectrum bins.
    pub bin_count: usize,
}

impl Default for AnalyserConfig {
    fn default() -> Self {
        Self {
            frame_size: 512,
            bin_count: 128,
        }
    }
}

impl AnalyserConfig {
    pub fn block_len(&self) -> usize {
        2 * self.frame_size
    }

    /// Transform window length in complex points.
    pub fn window_len(&self) -> usize {
        2 * self.frame_size
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if !self.frame_size.is_power_of_two() {
            return Err(PlayerError::config(format!(
                "analyser frame size {} is not a power of two",
                self.frame_size
            )));
        }
        if self.bin_count == 0 || self.bin_count > self.frame_size {
            return Err(PlayerError::config(format!(
                "bin count {} must lie in 1..={}",
                self.bin_count, self.frame_size
            )));
        }
        Ok(())
    }
}

/// Ring buffer sizing for the buffered stage, in samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub capacity: usize,
    /// The producer is woken once occupancy falls to this level.
    pub low_watermark: usize,
    /// The producer stops filling at this level.
    pub high_watermark: usize,
    /// Samples pulled from upstream per producer iteration.
    pub chunk: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        // Roughly 1.5 s of stereo audio at 44.1 kHz.
        Self {
            capacity: 131_072,
            low_watermark: 32_768,
            high_watermark: 131_072,
            chunk: 4_096,
        }
    }
}

impl BufferConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.chunk == 0 {
            return Err(PlayerError::config("buffer chunk must be positive"));
        }
        if self.low_watermark == 0
            || self.low_watermark >= self.high_watermark
            || self.high_watermark > self.capacity
        {
            return Err(PlayerError::config(format!(
                "buffer watermarks must satisfy 0 < low ({}) < high ({}) <= capacity ({})",
                self.low_watermark, self.high_watermark, self.capacity
            )));
        }
        Ok(())
    }
}

/// Track discovery settings for the sequencing stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LibraryConfig {
    /// Matched case-insensitively, with or without a leading dot.
    pub extension: String,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            extension: "mp3".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert_eq!(config.block_len(), 1024);
        assert_eq!(config.analyser.window_len(), 1024);
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("player.json");
        std::fs::write(&path, r#"{ "analyser": { "frame_size": 256 } }"#).unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.analyser.frame_size, 256);
        assert_eq!(config.analyser.bin_count, 128);
        assert_eq!(config.buffer, BufferConfig::default());
    }

    #[test]
    fn saved_config_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("player.json");
        let mut config = AppConfig::default();
        config.library.extension = "flac".into();
        config.save(&path).unwrap();

        assert_eq!(AppConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn rejects_inverted_watermarks() {
        let mut config = AppConfig::default();
        config.buffer.low_watermark = config.buffer.high_watermark;
        assert!(matches!(config.validate(), Err(PlayerError::Config(_))));

        let mut config = AppConfig::default();
        config.buffer.high_watermark = config.buffer.capacity + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_analyser_shape() {
        let mut config = AppConfig::default();
        config.analyser.frame_size = 500;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.analyser.bin_count = 513;
        assert!(config.validate().is_err());
    }
}
