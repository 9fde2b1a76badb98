use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{BackendKind, LoopStationError, MemoryInput, Result, DEFAULT_TRACK_COUNT};

/// Top-level configuration structure for the station.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StationConfig {
    pub track_count: usize,
    pub audio: AudioConfig,
    /// Where projects are stored; the platform data directory when unset.
    pub project_dir: Option<PathBuf>,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            track_count: DEFAULT_TRACK_COUNT,
            audio: AudioConfig::default(),
            project_dir: None,
        }
    }
}

impl StationConfig {
    /// Reads a JSON config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.track_count == 0 {
            return Err(LoopStationError::config("track_count must be at least 1"));
        }
        if let MemoryInput::Tone {
            frequency_hz,
            amplitude,
        } = self.audio.memory_input
        {
            if !(frequency_hz.is_finite() && frequency_hz > 0.0) {
                return Err(LoopStationError::config(
                    "memory tone frequency must be positive",
                ));
            }
            if !(0.0..=1.0).contains(&amplitude) {
                return Err(LoopStationError::config(
                    "memory tone amplitude must be within 0..=1",
                ));
            }
        }
        Ok(())
    }

    /// Configured project directory, or `<data dir>/loopstation/projects`.
    pub fn resolved_project_dir(&self) -> Result<PathBuf> {
        match &self.project_dir {
            Some(dir) => Ok(dir.clone()),
            None => dirs::data_dir()
                .map(|dir| dir.join("loopstation").join("projects"))
                .ok_or_else(|| {
                    LoopStationError::config("no data directory, set `project_dir`")
                }),
        }
    }
}

/// Configuration specific to the audio devices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub backend: BackendKind,
    /// Capture device name; the host default when unset.
    pub input_device: Option<String>,
    /// Playback device name; the host default when unset.
    pub output_device: Option<String>,
    /// Signal the memory backend records.
    pub memory_input: MemoryInput,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            input_device: None,
            output_device: None,
            memory_input: MemoryInput::Silence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_uses_defaults() {
        let config = StationConfig::from_json("{}").unwrap();
        assert_eq!(config, StationConfig::default());
        assert_eq!(config.track_count, 4);
    }

    #[test]
    fn parses_a_full_config() {
        let config = StationConfig::from_json(
            r#"{
                "track_count": 6,
                "project_dir": "/tmp/loops",
                "audio": {
                    "backend": "memory",
                    "output_device": "USB Audio",
                    "memory_input": { "kind": "tone", "frequency_hz": 220.0, "amplitude": 0.3 }
                }
            }"#,
        )
        .unwrap();

        assert_eq!(config.track_count, 6);
        assert_eq!(config.audio.backend, BackendKind::Memory);
        assert_eq!(config.audio.output_device.as_deref(), Some("USB Audio"));
        assert!(config.audio.input_device.is_none());
        assert_eq!(
            config.resolved_project_dir().unwrap(),
            PathBuf::from("/tmp/loops")
        );
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(StationConfig::from_json(r#"{ "track_count": 0 }"#).is_err());
        assert!(StationConfig::from_json(
            r#"{ "audio": { "memory_input": { "kind": "tone", "frequency_hz": 440.0, "amplitude": 2.0 } } }"#
        )
        .is_err());
        assert!(StationConfig::from_json(r#"{ "audio": { "backend": "jack" } }"#).is_err());
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("station.json");
        std::fs::write(&path, r#"{ "track_count": 2 }"#).unwrap();
        assert_eq!(StationConfig::load(&path).unwrap().track_count, 2);
        assert!(StationConfig::load(&dir.path().join("missing.json")).is_err());
    }
}
