//! The loop station: a fixed bank of tracks plus at most one recording.

use std::sync::Arc;

use crate::{
    AudioBackend, CaptureSession, LoopStationError, PcmBuffer, Result, StorageError, TrackRecord,
    TrackSlot,
};

/// Track count of a default station.
pub const DEFAULT_TRACK_COUNT: usize = 4;

/// Result of a completed `stop_recording()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordingOutcome {
    /// Audio landed on this track.
    Stored { track: usize, bytes: usize },
    /// The device delivered nothing.
    Empty,
    /// No recording was in progress.
    NotRecording,
}

/// Result of [`LoopStation::play_all`].
#[derive(Debug, Default)]
pub struct PlayAllOutcome {
    /// Tracks playing afterwards, in track order.
    pub playing: Vec<usize>,
    /// Tracks that could not start and why.
    pub failed: Vec<(usize, LoopStationError)>,
}

/// An in-progress recording and the track that will receive it.
#[derive(Debug)]
struct ActiveCapture {
    session: CaptureSession,
    target: usize,
}

/// Fixed bank of tracks with at most one recording in progress.
pub struct LoopStation {
    backend: Arc<dyn AudioBackend>,
    tracks: Vec<TrackSlot>,
    capture: Option<ActiveCapture>,
    playing_all: bool,
}

impl LoopStation {
    /// Creates a station with `track_count` empty tracks numbered from 1.
    pub fn new(backend: Arc<dyn AudioBackend>, track_count: usize) -> Result<Self> {
        if track_count == 0 {
            return Err(LoopStationError::config("a station needs at least one track"));
        }

        let tracks = (1..=track_count)
            .map(|number| TrackSlot::new(number, Arc::clone(&backend)))
            .collect();

        Ok(Self {
            backend,
            tracks,
            capture: None,
            playing_all: false,
        })
    }

    pub fn backend(&self) -> &Arc<dyn AudioBackend> {
        &self.backend
    }

    /// Number of tracks, fixed at creation.
    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    /// All tracks in track order.
    pub fn tracks(&self) -> &[TrackSlot] {
        &self.tracks
    }

    /// Track by 1-based number, or [`LoopStationError::InvalidTrack`].
    pub fn track(&self, number: usize) -> Result<&TrackSlot> {
        number
            .checked_sub(1)
            .and_then(|index| self.tracks.get(index))
            .ok_or(LoopStationError::InvalidTrack(number))
    }

    pub fn track_mut(&mut self, number: usize) -> Result<&mut TrackSlot> {
        number
            .checked_sub(1)
            .and_then(|index| self.tracks.get_mut(index))
            .ok_or(LoopStationError::InvalidTrack(number))
    }

    /// True if at least one track holds audio.
    pub fn has_any_audio(&self) -> bool {
        self.tracks.iter().any(TrackSlot::has_audio)
    }

    /// Lowest-numbered track without audio.
    pub fn first_free_track(&self) -> Option<usize> {
        self.tracks
            .iter()
            .find(|track| !track.has_audio())
            .map(TrackSlot::number)
    }

    /// True between a successful `start_recording` and `stop_recording`.
    pub fn is_recording(&self) -> bool {
        self.capture.is_some()
    }

    /// Track number the active recording will be stored on.
    pub fn recording_target(&self) -> Option<usize> {
        self.capture.as_ref().map(|capture| capture.target)
    }

    /// True after `play_all` started something and until `stop_all`.
    pub fn is_playing_all(&self) -> bool {
        self.playing_all
    }

    /// Opens the input device and starts recording onto the first free track.
    ///
    /// Returns the track number that will receive the audio. No device is
    /// touched when every track is full or a recording is already running.
    pub fn start_recording(&mut self) -> Result<usize> {
        if self.capture.is_some() {
            return Err(LoopStationError::CaptureAlreadyActive);
        }
        let target = self.first_free_track().ok_or(LoopStationError::NoFreeTrack)?;

        let mut session = CaptureSession::open(self.backend.as_ref());
        session.start()?;

        tracing::info!(track = target, "recording to track");
        self.capture = Some(ActiveCapture { session, target });
        Ok(target)
    }

    /// Stops the active recording (blocking until the capture thread exits)
    /// and stores the audio on the track chosen at start.
    pub fn stop_recording(&mut self) -> Result<RecordingOutcome> {
        let Some(mut capture) = self.capture.take() else {
            return Ok(RecordingOutcome::NotRecording);
        };

        let Some(buffer) = capture.session.stop()? else {
            tracing::info!(track = capture.target, "recording captured no audio");
            return Ok(RecordingOutcome::Empty);
        };

        let bytes = buffer.len();
        let target_free = self
            .track(capture.target)
            .is_ok_and(|track| !track.has_audio());
        let number = if target_free {
            capture.target
        } else {
            match self.first_free_track() {
                Some(number) => {
                    tracing::info!(
                        wanted = capture.target,
                        track = number,
                        "target track was filled while recording"
                    );
                    number
                }
                None => {
                    tracing::warn!(track = capture.target, bytes, "no free track for captured audio");
                    return Err(LoopStationError::CaptureDiscarded { bytes });
                }
            }
        };

        // the buffer is kept on the track even when no output device opens
        if let Err(err) = self.track_mut(number)?.set_audio_data(buffer) {
            tracing::warn!(track = number, error = %err, "stored recording without a playback device");
        }
        tracing::info!(track = number, bytes, "recording saved to track");
        Ok(RecordingOutcome::Stored {
            track: number,
            bytes,
        })
    }

    /// Starts every track holding audio, in track order. Tracks already
    /// playing are left alone; starts are independent, not sample-aligned.
    ///
    /// A track that fails to start does not stop the others; it is listed
    /// in [`PlayAllOutcome::failed`].
    pub fn play_all(&mut self) -> Result<PlayAllOutcome> {
        if !self.has_any_audio() {
            return Err(LoopStationError::NothingToPlay);
        }

        let mut failed = Vec::new();
        for track in self.tracks.iter_mut().filter(|t| t.has_audio()) {
            if let Err(err) = track.play() {
                tracing::warn!(track = track.number(), error = %err, "track failed to start");
                failed.push((track.number(), err));
            }
        }

        let playing: Vec<usize> = self
            .tracks
            .iter()
            .filter(|t| t.is_playing())
            .map(TrackSlot::number)
            .collect();
        self.playing_all = !playing.is_empty();

        Ok(PlayAllOutcome { playing, failed })
    }

    /// Stops every track in order, joining each playback thread.
    pub fn stop_all(&mut self) -> Result<()> {
        let mut first_error = None;
        for track in &mut self.tracks {
            if let Err(err) = track.stop() {
                tracing::warn!(track = track.number(), error = %err, "track failed to stop cleanly");
                first_error.get_or_insert(err);
            }
        }
        self.playing_all = false;
        first_error.map_or(Ok(()), Err)
    }

    /// Plays all tracks, or stops them if the last transport call played them.
    ///
    /// Returns what `play_all` reported, or `None` when the tracks were stopped.
    pub fn toggle_play_all(&mut self) -> Result<Option<PlayAllOutcome>> {
        if self.playing_all {
            self.stop_all()?;
            Ok(None)
        } else {
            self.play_all().map(Some)
        }
    }

    /// Starts one track looping; no-op for an empty track.
    pub fn play_track(&mut self, number: usize) -> Result<()> {
        self.track_mut(number)?.play()
    }

    /// Stops one track, joining its playback thread.
    pub fn stop_track(&mut self, number: usize) -> Result<()> {
        self.track_mut(number)?.stop()
    }

    pub fn set_track_volume(&mut self, number: usize, volume: f32) -> Result<()> {
        self.track_mut(number)?.set_volume(volume);
        Ok(())
    }

    pub fn set_track_muted(&mut self, number: usize, muted: bool) -> Result<()> {
        self.track_mut(number)?.set_muted(muted);
        Ok(())
    }

    /// Stops one track and drops its audio, volume and mute.
    pub fn clear_track(&mut self, number: usize) -> Result<()> {
        self.track_mut(number)?.clear();
        Ok(())
    }

    /// Clears every track. Confirmation is the caller's business.
    pub fn clear_all(&mut self) {
        for track in &mut self.tracks {
            track.clear();
        }
        self.playing_all = false;
    }

    /// Checks that every record targets an existing track, once.
    pub fn validate_records(&self, records: &[TrackRecord]) -> Result<()> {
        let mut seen = vec![false; self.track_count()];
        for record in records {
            record.validate(self.track_count())?;
            let slot = &mut seen[record.track_number - 1];
            if std::mem::replace(slot, true) {
                return Err(StorageError::Malformed(format!(
                    "track {} stored twice",
                    record.track_number
                ))
                .into());
            }
        }
        Ok(())
    }

    /// Replaces the station's content with `records`.
    ///
    /// All records are validated before anything changes, so a bad record
    /// leaves the station untouched.
    pub fn apply_records(&mut self, records: Vec<TrackRecord>) -> Result<()> {
        self.validate_records(&records)?;

        if let Err(err) = self.stop_all() {
            tracing::warn!(error = %err, "stopping playback before load");
        }
        self.clear_all();

        for record in records {
            let track = self.track_mut(record.track_number)?;
            if let Err(err) = track.set_audio_data(record.audio) {
                tracing::warn!(track = record.track_number, error = %err, "loaded track has no playback device");
            }
            track.set_volume(record.volume);
            track.set_muted(record.muted);
        }
        Ok(())
    }

    /// Discards an active recording and closes every playback engine.
    pub fn shutdown(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            match capture.session.stop() {
                Ok(buffer) => {
                    let bytes = buffer.as_ref().map_or(0, PcmBuffer::len);
                    tracing::info!(bytes, "discarding recording on shutdown");
                }
                Err(err) => tracing::warn!(error = %err, "capture failed during shutdown"),
            }
        }
        if let Err(err) = self.stop_all() {
            tracing::warn!(error = %err, "playback failed during shutdown");
        }
    }
}

impl Drop for LoopStation {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for LoopStation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopStation")
            .field("backend", &self.backend.name())
            .field("tracks", &self.tracks)
            .field("capture", &self.capture)
            .field("playing_all", &self.playing_all)
            .finish()
    }
}
