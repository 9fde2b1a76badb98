//! Core library for the Loopstation multi-track looper.
//!
//! A station holds a fixed bank of tracks. Audio is captured from an input
//! device into the first free track and played back as a continuously
//! looping layer, each track with its own gain and mute. Every capture and
//! every playing track runs on a dedicated thread that is joined when it is
//! stopped. There is no software mixing: each track writes to its own output
//! stream and the host audio system sums them.
//!
//! All audio is 44.1 kHz signed 16-bit little-endian mono PCM, see
//! [`PcmFormat::STATION`].

pub mod capture;
pub mod config;
pub mod device;
pub mod error;
pub mod format;
pub mod playback;
pub mod project;
pub mod station;
pub mod track;

pub use capture::{CaptureSession, CAPTURE_FRAME_BYTES};
pub use config::{AudioConfig, StationConfig};
pub use device::memory::{MemoryBackend, MemoryInput, Pacing};
pub use device::{
    backend_from_config, AudioBackend, BackendKind, DeviceInfo, DeviceRole, InputDevice,
    OutputDevice, PcmReader, PcmWriter,
};
pub use error::{LoopStationError, Result, StorageError};
pub use format::{apply_gain, scale_sample, PcmBuffer, PcmFormat, CHUNK_BYTES};
pub use playback::{clamp_volume, AtomicGain, LoopPlaybackEngine};
pub use project::{
    CurrentProject, JsonProjectStore, MemoryProjectStore, ProjectId, ProjectInfo, ProjectSession,
    ProjectStore, TrackRecord,
};
pub use station::{LoopStation, PlayAllOutcome, RecordingOutcome, DEFAULT_TRACK_COUNT};
pub use track::{TrackSlot, DEFAULT_VOLUME};
