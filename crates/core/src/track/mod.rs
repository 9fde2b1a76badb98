use std::{fmt, sync::Arc, time::Duration};

use crate::{clamp_volume, AudioBackend, LoopPlaybackEngine, LoopStationError, PcmBuffer, Result};

/// Volume of a new or cleared track.
pub const DEFAULT_VOLUME: f32 = 1.0;

/// One of the station's fixed track positions.
///
/// Volume and mute live on the slot and are mirrored into the playback
/// engine whenever one exists, so they survive stop/play and save/load.
pub struct TrackSlot {
    number: usize,
    backend: Arc<dyn AudioBackend>,
    audio: Option<PcmBuffer>,
    engine: Option<LoopPlaybackEngine>,
    volume: f32,
    muted: bool,
}

impl TrackSlot {
    /// Creates an empty slot. `number` is 1-based.
    pub fn new(number: usize, backend: Arc<dyn AudioBackend>) -> Self {
        Self {
            number,
            backend,
            audio: None,
            engine: None,
            volume: DEFAULT_VOLUME,
            muted: false,
        }
    }

    /// 1-based position in the station.
    pub fn number(&self) -> usize {
        self.number
    }

    /// True while the slot holds a recorded or loaded buffer.
    pub fn has_audio(&self) -> bool {
        self.audio.is_some()
    }

    /// The slot's buffer, if any.
    pub fn audio_data(&self) -> Option<&PcmBuffer> {
        self.audio.as_ref()
    }

    /// Loop length; zero for an empty slot.
    pub fn duration(&self) -> Duration {
        self.audio
            .as_ref()
            .map(PcmBuffer::duration)
            .unwrap_or_default()
    }

    /// Replaces the slot's audio and playback engine. Volume and mute carry
    /// over to the new engine.
    ///
    /// The buffer is kept even if no output device can be opened; `play()`
    /// retries the device later. An empty buffer is refused with
    /// [`LoopStationError::EmptyAudio`] and the slot is left as it was.
    pub fn set_audio_data(&mut self, buffer: PcmBuffer) -> Result<()> {
        if buffer.is_empty() {
            return Err(LoopStationError::EmptyAudio);
        }
        self.close_engine();
        self.audio = Some(buffer.clone());

        let engine = LoopPlaybackEngine::new(buffer, self.backend.as_ref())?;
        engine.set_volume(self.volume);
        engine.set_muted(self.muted);
        self.engine = Some(engine);
        Ok(())
    }

    /// Starts looping. No-op without audio.
    pub fn play(&mut self) -> Result<()> {
        let Some(buffer) = &self.audio else {
            return Ok(());
        };

        if self.engine.is_none() {
            let engine = LoopPlaybackEngine::new(buffer.clone(), self.backend.as_ref())?;
            engine.set_volume(self.volume);
            engine.set_muted(self.muted);
            self.engine = Some(engine);
        }

        match &mut self.engine {
            Some(engine) => {
                engine.play()?;
                tracing::debug!(track = self.number, "track playing");
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Stops looping. No-op without a playback engine.
    pub fn stop(&mut self) -> Result<()> {
        match &mut self.engine {
            Some(engine) => {
                engine.stop()?;
                tracing::debug!(track = self.number, "track stopped");
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// True while the engine's playback thread is running.
    pub fn is_playing(&self) -> bool {
        self.engine.as_ref().is_some_and(LoopPlaybackEngine::is_playing)
    }

    /// Stops and closes the engine, drops the audio and resets volume and mute.
    pub fn clear(&mut self) {
        self.close_engine();
        self.audio = None;
        self.volume = DEFAULT_VOLUME;
        self.muted = false;
    }

    /// Stored gain in `[0, 1]`.
    pub fn volume(&self) -> f32 {
        self.volume
    }

    /// Clamps `volume` to `[0, 1]` and applies it from the next chunk.
    pub fn set_volume(&mut self, volume: f32) {
        self.volume = clamp_volume(volume);
        if let Some(engine) = &self.engine {
            engine.set_volume(self.volume);
        }
    }

    /// Whether playback is silenced.
    pub fn is_muted(&self) -> bool {
        self.muted
    }

    /// Mutes or unmutes from the next chunk; the loop keeps its position.
    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
        if let Some(engine) = &self.engine {
            engine.set_muted(muted);
        }
    }

    /// Flips the mute state and returns the new value.
    pub fn toggle_mute(&mut self) -> bool {
        self.set_muted(!self.muted);
        self.muted
    }

    /// Live playback engine, present while the slot holds audio and a device
    /// could be opened for it.
    pub fn engine(&self) -> Option<&LoopPlaybackEngine> {
        self.engine.as_ref()
    }

    fn close_engine(&mut self) {
        if let Some(engine) = self.engine.take() {
            if let Err(err) = engine.close() {
                tracing::warn!(track = self.number, error = %err, "playback engine closed with an error");
            }
        }
    }
}

impl fmt::Debug for TrackSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackSlot")
            .field("number", &self.number)
            .field("audio", &self.audio)
            .field("playing", &self.is_playing())
            .field("volume", &self.volume)
            .field("muted", &self.muted)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::memory::MemoryBackend;

    fn slot(backend: &MemoryBackend) -> TrackSlot {
        TrackSlot::new(1, Arc::new(backend.clone()))
    }

    #[test]
    fn audio_round_trips_bit_exact() {
        let backend = MemoryBackend::realtime();
        let mut track = slot(&backend);
        let bytes: Vec<u8> = (0..=255).cycle().take(10_001).collect();

        track.set_audio_data(PcmBuffer::new(bytes.clone())).unwrap();
        assert!(track.has_audio());
        assert_eq!(track.audio_data().unwrap().as_bytes(), bytes.as_slice());
    }

    #[test]
    fn replacing_audio_closes_the_old_engine() {
        let backend = MemoryBackend::realtime();
        let mut track = slot(&backend);

        track.set_audio_data(PcmBuffer::new(vec![0; 64])).unwrap();
        track.play().unwrap();
        track.set_audio_data(PcmBuffer::new(vec![0; 128])).unwrap();

        assert_eq!(backend.outputs_opened(), 2);
        assert_eq!(backend.outputs_open(), 1);
        assert!(!track.is_playing());
    }

    #[test]
    fn empty_slot_ignores_transport() {
        let backend = MemoryBackend::realtime();
        let mut track = slot(&backend);
        track.play().unwrap();
        track.stop().unwrap();
        assert!(!track.is_playing());
        assert_eq!(backend.outputs_opened(), 0);
    }

    #[test]
    fn volume_and_mute_follow_into_the_engine() {
        let backend = MemoryBackend::realtime();
        let mut track = slot(&backend);
        track.set_volume(0.3);
        track.set_muted(true);

        track.set_audio_data(PcmBuffer::new(vec![0; 64])).unwrap();
        let engine = track.engine().unwrap();
        approx::assert_relative_eq!(engine.volume(), 0.3);
        assert!(engine.is_muted());

        assert!(!track.toggle_mute());
        assert!(!track.engine().unwrap().is_muted());
    }

    #[test]
    fn clear_resets_everything() {
        let backend = MemoryBackend::realtime();
        let mut track = slot(&backend);
        track.set_audio_data(PcmBuffer::new(vec![0; 4096])).unwrap();
        track.set_volume(0.2);
        track.set_muted(true);
        track.play().unwrap();

        track.clear();
        assert!(!track.has_audio());
        assert!(track.engine().is_none());
        assert_eq!(track.volume(), DEFAULT_VOLUME);
        assert!(!track.is_muted());
        assert_eq!(backend.outputs_open(), 0);
        assert_eq!(backend.writers_active(), 0);
    }

    #[test]
    fn empty_audio_is_rejected() {
        let backend = MemoryBackend::realtime();
        let mut track = slot(&backend);
        track.set_audio_data(PcmBuffer::new(vec![3; 16])).unwrap();

        assert!(matches!(
            track.set_audio_data(PcmBuffer::new(Vec::new())),
            Err(LoopStationError::EmptyAudio)
        ));
        assert_eq!(track.audio_data().unwrap().as_bytes(), &[3; 16]);
        assert!(track.engine().is_some());
    }

    #[test]
    fn engine_is_created_lazily_when_the_device_returns() {
        let backend = MemoryBackend::realtime();
        backend.set_output_available(false);
        let mut track = slot(&backend);

        assert!(track.set_audio_data(PcmBuffer::new(vec![0; 64])).is_err());
        assert!(track.has_audio());
        assert!(track.engine().is_none());

        backend.set_output_available(true);
        track.play().unwrap();
        assert!(track.is_playing());
        track.stop().unwrap();
    }
}
