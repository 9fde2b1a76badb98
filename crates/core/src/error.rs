/// Result alias that carries the custom [`LoopStationError`] type.
pub type Result<T> = std::result::Result<T, LoopStationError>;

/// Common error type for the core crate.
///
/// Device variants are fatal to the session or engine that raised them but
/// never to the rest of the station. The track bookkeeping variants
/// (`NoFreeTrack`, `CaptureAlreadyActive`, ...) are expected, recoverable
/// conditions that callers are meant to render as status.
#[derive(Debug, thiserror::Error)]
pub enum LoopStationError {
    /// No matching device exists, it is busy, or it cannot run the fixed PCM format.
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),
    /// A device failed while a capture or playback thread was using it.
    #[error("audio device failed: {0}")]
    DeviceFailure(String),
    /// Every track already holds audio.
    #[error("all tracks are full, clear a track first")]
    NoFreeTrack,
    /// Only one recording may run at a time.
    #[error("a recording is already in progress")]
    CaptureAlreadyActive,
    /// Play all was asked for with no track holding audio.
    #[error("no tracks to play, record something first")]
    NothingToPlay,
    /// Audio was captured but no track could take it.
    #[error("captured audio ({bytes} bytes) was discarded, no free track")]
    CaptureDiscarded { bytes: usize },
    /// Track numbers run from 1 to the station's track count.
    #[error("track {0} does not exist")]
    InvalidTrack(usize),
    /// A track was handed a buffer with no samples.
    #[error("audio buffer is empty")]
    EmptyAudio,
    /// Saving a project needs at least one track with audio.
    #[error("no audio to save, record something first")]
    NothingToSave,
    /// Project names must contain more than whitespace.
    #[error("project name cannot be empty")]
    EmptyProjectName,
    /// A lock was poisoned by a panicking thread.
    #[error("{0} has been poisoned")]
    Poisoned(&'static str),
    /// The project store failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// A configuration value is out of range or missing.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl LoopStationError {
    /// Creates a configuration error that simply wraps the provided message.
    pub fn config<T: Into<String>>(msg: T) -> Self {
        Self::Config(msg.into())
    }

    /// True for the bookkeeping conditions a UI shows as a status line.
    pub fn is_status(&self) -> bool {
        matches!(
            self,
            Self::NoFreeTrack
                | Self::CaptureAlreadyActive
                | Self::NothingToPlay
                | Self::CaptureDiscarded { .. }
                | Self::NothingToSave
                | Self::EmptyProjectName
        )
    }
}

/// Failures reported by a project store.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Reading or writing project files failed.
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
    /// Project metadata is not valid JSON.
    #[error("storage format error: {0}")]
    Json(#[from] serde_json::Error),
    /// No project with this id exists.
    #[error("project {0} not found")]
    ProjectNotFound(u32),
    /// Project data parsed but does not fit the station.
    #[error("malformed project data: {0}")]
    Malformed(String),
}

impl From<std::io::Error> for LoopStationError {
    fn from(value: std::io::Error) -> Self {
        Self::Storage(StorageError::Io(value))
    }
}

impl From<serde_json::Error> for LoopStationError {
    fn from(value: serde_json::Error) -> Self {
        Self::Storage(StorageError::Json(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bookkeeping_errors_are_status() {
        assert!(LoopStationError::NoFreeTrack.is_status());
        assert!(LoopStationError::CaptureDiscarded { bytes: 4 }.is_status());
        assert!(!LoopStationError::DeviceUnavailable("busy".into()).is_status());
    }

    #[test]
    fn storage_errors_keep_their_cause() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only volume");
        let err = LoopStationError::from(io);
        assert!(format!("{err}").contains("read-only volume"));
    }
}
