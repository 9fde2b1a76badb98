//! Audio device abstraction.
//!
//! The engine talks to devices through a small blocking contract: a capture
//! thread calls [`PcmReader::read_frame`] and blocks until a whole frame of
//! bytes has arrived, a playback thread calls [`PcmWriter::write_chunk`] and
//! blocks until the device accepted the chunk. Blocking writes are what pace
//! playback to the device clock.
//!
//! Backends decide how that contract maps onto the host audio API. The
//! in-process [`memory::MemoryBackend`] is always available; the CPAL backend
//! is compiled with the `cpal` feature.

#[cfg(feature = "cpal")]
pub mod cpal_backend;
pub mod memory;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{AudioConfig, LoopStationError, PcmFormat, Result};

/// Direction of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceRole {
    Input,
    Output,
}

/// Name of a device as reported by its backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub name: String,
    pub role: DeviceRole,
    pub is_default: bool,
}

/// Factory for input and output devices configured to the station format.
pub trait AudioBackend: Send + Sync {
    fn name(&self) -> &str;

    fn devices(&self) -> Result<Vec<DeviceInfo>>;

    /// Opens the configured capture device, or fails with
    /// [`LoopStationError::DeviceUnavailable`].
    fn open_input(&self, format: &PcmFormat) -> Result<Box<dyn InputDevice>>;

    /// Opens an independent output stream. Every playback engine gets its own.
    fn open_output(&self, format: &PcmFormat) -> Result<Box<dyn OutputDevice>>;
}

/// An open capture device. Dropping it releases the device.
pub trait InputDevice {
    fn start(&mut self) -> Result<()>;

    fn stop(&mut self) -> Result<()>;

    /// Handle that a dedicated thread can block on.
    fn reader(&self) -> Box<dyn PcmReader>;
}

/// An open output device. Dropping it releases the device.
pub trait OutputDevice {
    fn start(&mut self) -> Result<()>;

    fn stop(&mut self) -> Result<()>;

    fn writer(&self) -> Box<dyn PcmWriter>;
}

pub trait PcmReader: Send {
    /// Blocks until `frame` is full and returns the number of bytes read.
    /// Fewer bytes than requested means the device delivered a short read.
    fn read_frame(&mut self, frame: &mut [u8]) -> Result<usize>;
}

pub trait PcmWriter: Send {
    /// Blocks until the device has accepted the whole chunk.
    fn write_chunk(&mut self, chunk: &[u8]) -> Result<()>;
}

/// Which backend a station opens its devices on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Cpal,
    Memory,
}

impl Default for BackendKind {
    fn default() -> Self {
        if cfg!(feature = "cpal") {
            Self::Cpal
        } else {
            Self::Memory
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = LoopStationError;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "cpal" => Ok(Self::Cpal),
            "memory" => Ok(Self::Memory),
            other => Err(LoopStationError::config(format!(
                "unknown audio backend `{other}`"
            ))),
        }
    }
}

/// Builds the backend selected in `config`.
pub fn backend_from_config(config: &AudioConfig) -> Result<Arc<dyn AudioBackend>> {
    match config.backend {
        #[cfg(feature = "cpal")]
        BackendKind::Cpal => Ok(Arc::new(cpal_backend::CpalBackend::new(
            config.input_device.clone(),
            config.output_device.clone(),
        ))),
        #[cfg(not(feature = "cpal"))]
        BackendKind::Cpal => Err(LoopStationError::config(
            "the cpal backend is not compiled in, rebuild with `--features cpal`",
        )),
        BackendKind::Memory => Ok(Arc::new(memory::MemoryBackend::new(
            memory::Pacing::RealTime,
            config.memory_input,
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_backend_names() {
        assert_eq!("memory".parse::<BackendKind>().unwrap(), BackendKind::Memory);
        assert_eq!("CPAL".parse::<BackendKind>().unwrap(), BackendKind::Cpal);
        assert!("jack".parse::<BackendKind>().is_err());
    }

    #[test]
    fn memory_backend_from_config() {
        let config = AudioConfig {
            backend: BackendKind::Memory,
            ..Default::default()
        };
        let backend = backend_from_config(&config).unwrap();
        assert_eq!(backend.name(), "memory");
    }
}
