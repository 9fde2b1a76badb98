//! Looping playback of one track.
//!
//! Each [`LoopPlaybackEngine`] owns an output device and, while playing, one
//! thread that streams the buffer to it chunk by chunk, wrapping to the start
//! at the end. Volume and mute are read once per chunk, so a change made from
//! the control thread lands within one chunk (~46 ms at the station format).

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
};

use crate::{
    apply_gain, AudioBackend, LoopStationError, OutputDevice, PcmBuffer, PcmFormat, PcmWriter,
    Result, CHUNK_BYTES,
};

/// Clamps a gain to [0, 1]; NaN is treated as silence.
pub fn clamp_volume(volume: f32) -> f32 {
    if volume.is_nan() {
        0.0
    } else {
        volume.clamp(0.0, 1.0)
    }
}

/// `f32` stored as raw bits so the playback thread can read it without a lock.
#[derive(Debug)]
pub struct AtomicGain {
    bits: AtomicU32,
}

impl AtomicGain {
    pub fn new(value: f32) -> Self {
        Self {
            bits: AtomicU32::new(value.to_bits()),
        }
    }

    #[inline]
    pub fn get(&self) -> f32 {
        f32::from_bits(self.bits.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set(&self, value: f32) {
        self.bits.store(value.to_bits(), Ordering::Release);
    }
}

/// State shared between the control thread and the playback thread.
#[derive(Debug)]
struct Controls {
    playing: AtomicBool,
    muted: AtomicBool,
    volume: AtomicGain,
    /// Bytes of the buffer consumed since the last `play()`, muted or not.
    advanced: AtomicUsize,
    loops: AtomicUsize,
    fault: Mutex<Option<String>>,
}

impl Controls {
    fn record_fault(&self, message: String) {
        if let Ok(mut slot) = self.fault.lock() {
            slot.get_or_insert(message);
        }
    }

    fn take_fault(&self) -> Result<Option<String>> {
        self.fault
            .lock()
            .map(|mut slot| slot.take())
            .map_err(|_| LoopStationError::Poisoned("playback fault slot"))
    }
}

pub struct LoopPlaybackEngine {
    buffer: PcmBuffer,
    format: PcmFormat,
    device: Box<dyn OutputDevice>,
    controls: Arc<Controls>,
    thread: Option<JoinHandle<()>>,
}

impl LoopPlaybackEngine {
    /// Opens a dedicated output device for `buffer`.
    pub fn new(buffer: PcmBuffer, backend: &dyn AudioBackend) -> Result<Self> {
        let format = PcmFormat::STATION;
        let device = backend.open_output(&format)?;

        Ok(Self {
            buffer,
            format,
            device,
            controls: Arc::new(Controls {
                playing: AtomicBool::new(false),
                muted: AtomicBool::new(false),
                volume: AtomicGain::new(1.0),
                advanced: AtomicUsize::new(0),
                loops: AtomicUsize::new(0),
                fault: Mutex::new(None),
            }),
            thread: None,
        })
    }

    pub fn buffer(&self) -> &PcmBuffer {
        &self.buffer
    }

    /// Starts looping. Does nothing if already playing.
    ///
    /// A fault left behind by a previous run is reported here once and
    /// cleared, so the following call starts playback again.
    pub fn play(&mut self) -> Result<()> {
        if self.is_playing() {
            return Ok(());
        }
        // a thread that exited on its own (device fault) still needs joining
        self.join_thread()?;
        if let Some(fault) = self.controls.take_fault()? {
            let _ = self.device.stop();
            return Err(LoopStationError::DeviceFailure(fault));
        }
        if self.buffer.is_empty() {
            tracing::debug!("refusing to loop an empty buffer");
            return Ok(());
        }

        self.device.start()?;
        self.controls.advanced.store(0, Ordering::Release);
        self.controls.loops.store(0, Ordering::Release);
        self.controls.playing.store(true, Ordering::Release);

        let writer = self.device.writer();
        let buffer = self.buffer.clone();
        let format = self.format;
        let controls = Arc::clone(&self.controls);
        let spawned = thread::Builder::new()
            .name("loop-playback".to_string())
            .spawn(move || run_loop(buffer, format, writer, &controls));

        match spawned {
            Ok(handle) => {
                self.thread = Some(handle);
                tracing::debug!(bytes = self.buffer.len(), "playback started");
                Ok(())
            }
            Err(err) => {
                self.controls.playing.store(false, Ordering::Release);
                let _ = self.device.stop();
                Err(LoopStationError::DeviceFailure(format!(
                    "failed to spawn playback thread: {err}"
                )))
            }
        }
    }

    /// Stops looping and blocks until the playback thread has exited.
    /// Idempotent. Reports a device fault the thread ran into.
    pub fn stop(&mut self) -> Result<()> {
        self.controls.playing.store(false, Ordering::Release);
        let joined = self.join_thread();
        self.device.stop()?;
        joined?;

        match self.controls.take_fault()? {
            Some(fault) => Err(LoopStationError::DeviceFailure(fault)),
            None => Ok(()),
        }
    }

    /// Stops playback and releases the output device.
    pub fn close(mut self) -> Result<()> {
        self.stop()
    }

    pub fn is_playing(&self) -> bool {
        self.controls.playing.load(Ordering::Acquire)
    }

    pub fn set_volume(&self, volume: f32) {
        self.controls.volume.set(clamp_volume(volume));
    }

    pub fn volume(&self) -> f32 {
        self.controls.volume.get()
    }

    pub fn set_muted(&self, muted: bool) {
        self.controls.muted.store(muted, Ordering::Release);
    }

    pub fn is_muted(&self) -> bool {
        self.controls.muted.load(Ordering::Acquire)
    }

    /// Bytes advanced through the loop since `play()`, muted chunks included.
    pub fn bytes_advanced(&self) -> usize {
        self.controls.advanced.load(Ordering::Acquire)
    }

    /// Current byte offset inside the buffer.
    pub fn position(&self) -> usize {
        match self.buffer.len() {
            0 => 0,
            len => self.bytes_advanced() % len,
        }
    }

    /// Complete passes over the buffer since `play()`.
    pub fn loops_completed(&self) -> usize {
        self.controls.loops.load(Ordering::Acquire)
    }

    /// Device fault recorded by the playback thread, if any.
    pub fn fault(&self) -> Option<String> {
        self.controls
            .fault
            .lock()
            .ok()
            .and_then(|slot| slot.clone())
    }

    fn join_thread(&mut self) -> Result<()> {
        match self.thread.take() {
            Some(handle) => handle.join().map_err(|_| {
                LoopStationError::DeviceFailure("playback thread panicked".to_string())
            }),
            None => Ok(()),
        }
    }
}

impl Drop for LoopPlaybackEngine {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            tracing::warn!(error = %err, "playback engine closed with an error");
        }
    }
}

impl std::fmt::Debug for LoopPlaybackEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopPlaybackEngine")
            .field("buffer", &self.buffer)
            .field("playing", &self.is_playing())
            .field("muted", &self.is_muted())
            .field("volume", &self.volume())
            .finish()
    }
}

fn run_loop(
    buffer: PcmBuffer,
    format: PcmFormat,
    mut writer: Box<dyn PcmWriter>,
    controls: &Controls,
) {
    let mut scaled = Vec::with_capacity(CHUNK_BYTES);

    'looping: while controls.playing.load(Ordering::Acquire) {
        for chunk in buffer.chunks() {
            if !controls.playing.load(Ordering::Acquire) {
                break 'looping;
            }

            if controls.muted.load(Ordering::Acquire) {
                // keep the loop position moving in step with the device clock
                thread::sleep(format.duration_of(chunk.len()));
            } else {
                apply_gain(chunk, controls.volume.get(), &mut scaled);
                if let Err(err) = writer.write_chunk(&scaled) {
                    tracing::warn!(error = %err, "playback device failed");
                    controls.record_fault(err.to_string());
                    controls.playing.store(false, Ordering::Release);
                    break 'looping;
                }
            }

            controls.advanced.fetch_add(chunk.len(), Ordering::AcqRel);
        }
        controls.loops.fetch_add(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::device::memory::{MemoryBackend, MemoryInput, Pacing};

    fn engine_with(backend: &MemoryBackend, bytes: usize) -> LoopPlaybackEngine {
        LoopPlaybackEngine::new(PcmBuffer::new(vec![0x11; bytes]), backend).unwrap()
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn stop_joins_the_playback_thread() {
        let backend = MemoryBackend::realtime();
        let mut engine = engine_with(&backend, CHUNK_BYTES * 2);

        engine.play().unwrap();
        assert!(engine.is_playing());
        assert_eq!(backend.writers_active(), 1);

        engine.stop().unwrap();
        assert!(!engine.is_playing());
        // the writer is dropped only when the thread returns
        assert_eq!(backend.writers_active(), 0);
        assert_eq!(backend.outputs_running(), 0);

        engine.stop().unwrap();
    }

    #[test]
    fn play_twice_spawns_one_thread() {
        let backend = MemoryBackend::realtime();
        let mut engine = engine_with(&backend, CHUNK_BYTES);

        engine.play().unwrap();
        engine.play().unwrap();
        assert_eq!(backend.writers_active(), 1);
        engine.stop().unwrap();
    }

    #[test]
    fn loops_past_the_end_of_the_buffer() {
        let backend = MemoryBackend::new(Pacing::Unpaced, MemoryInput::Silence);
        let mut engine = engine_with(&backend, 100);

        engine.play().unwrap();
        assert!(wait_until(|| engine.loops_completed() >= 3));
        engine.stop().unwrap();
        assert!(backend.bytes_written() >= 300);
        assert!(engine.position() < 100);
    }

    fn to_bytes(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    fn play_once(backend: &MemoryBackend, engine: &mut LoopPlaybackEngine) -> Vec<u8> {
        let len = engine.buffer().len();
        backend.tap_output(len);
        engine.play().unwrap();
        assert!(wait_until(|| backend.bytes_written() >= len));
        engine.stop().unwrap();
        backend.tapped_output()
    }

    #[test]
    fn unity_gain_writes_the_buffer_unchanged() {
        let backend = MemoryBackend::new(Pacing::Unpaced, MemoryInput::Silence);
        let bytes: Vec<u8> = (0..CHUNK_BYTES * 2 + 100).map(|i| (i * 7 % 251) as u8).collect();
        let mut engine = LoopPlaybackEngine::new(PcmBuffer::new(bytes.clone()), &backend).unwrap();

        assert_eq!(play_once(&backend, &mut engine), bytes);
    }

    #[test]
    fn half_volume_halves_every_sample() {
        let backend = MemoryBackend::new(Pacing::Unpaced, MemoryInput::Silence);
        let pattern = [1000_i16, -1000, 32766, -32768, 0, 7];
        let input: Vec<i16> = pattern.iter().copied().cycle().take(CHUNK_BYTES).collect();
        let mut engine = LoopPlaybackEngine::new(PcmBuffer::new(to_bytes(&input)), &backend).unwrap();
        engine.set_volume(0.5);

        let expected: Vec<i16> = [500_i16, -500, 16383, -16384, 0, 3]
            .iter()
            .copied()
            .cycle()
            .take(CHUNK_BYTES)
            .collect();
        assert_eq!(play_once(&backend, &mut engine), to_bytes(&expected));
    }

    #[test]
    fn volume_change_lands_within_one_chunk() {
        let backend = MemoryBackend::realtime();
        let mut engine = engine_with(&backend, CHUNK_BYTES * 40);
        backend.tap_output(CHUNK_BYTES * 40);

        engine.play().unwrap();
        assert!(wait_until(|| backend.bytes_written() >= CHUNK_BYTES * 2));
        engine.set_volume(0.0);
        let mark = backend.bytes_written();
        assert!(wait_until(|| backend.bytes_written() >= mark + CHUNK_BYTES * 3));
        engine.stop().unwrap();

        let written = backend.tapped_output();
        assert!(written[..mark].iter().all(|&b| b == 0x11));
        // the chunk in flight at the change may still carry the old gain
        let after = &written[mark + CHUNK_BYTES..];
        assert!(!after.is_empty());
        assert!(after.iter().all(|&b| b == 0));
    }

    #[test]
    fn muted_playback_keeps_device_pace() {
        let backend = MemoryBackend::realtime();
        let mut engine = engine_with(&backend, CHUNK_BYTES * 8);
        engine.set_muted(true);

        let started = Instant::now();
        engine.play().unwrap();
        thread::sleep(Duration::from_millis(250));
        let advanced = engine.bytes_advanced();
        let elapsed = started.elapsed();
        engine.stop().unwrap();

        let allowed = PcmFormat::STATION.bytes_for(elapsed) + CHUNK_BYTES;
        assert!(advanced <= allowed, "{advanced} > {allowed}");
        assert!(advanced > 0);
        assert_eq!(backend.bytes_written(), 0);
    }

    #[test]
    fn volume_is_clamped() {
        let backend = MemoryBackend::realtime();
        let engine = engine_with(&backend, 16);

        engine.set_volume(1.7);
        assert_eq!(engine.volume(), 1.0);
        engine.set_volume(-2.0);
        assert_eq!(engine.volume(), 0.0);
        engine.set_volume(f32::NAN);
        assert_eq!(engine.volume(), 0.0);
        engine.set_volume(0.4);
        approx::assert_relative_eq!(engine.volume(), 0.4);
    }

    #[test]
    fn device_fault_is_reported_by_stop() {
        let backend = MemoryBackend::new(Pacing::Unpaced, MemoryInput::Silence);
        backend.fail_output_after(2);
        let mut engine = engine_with(&backend, CHUNK_BYTES * 4);

        engine.play().unwrap();
        assert!(wait_until(|| !engine.is_playing()));
        assert!(engine.fault().is_some());

        assert!(matches!(
            engine.stop(),
            Err(LoopStationError::DeviceFailure(_))
        ));
        assert!(engine.stop().is_ok());
    }

    #[test]
    fn empty_buffer_never_starts() {
        let backend = MemoryBackend::realtime();
        let mut engine = engine_with(&backend, 0);
        engine.play().unwrap();
        assert!(!engine.is_playing());
        assert_eq!(backend.writers_active(), 0);
    }

    #[test]
    fn closing_releases_the_device() {
        let backend = MemoryBackend::realtime();
        let mut engine = engine_with(&backend, CHUNK_BYTES);
        engine.play().unwrap();
        engine.close().unwrap();
        assert_eq!(backend.outputs_open(), 0);
    }

    #[test]
    fn output_unavailable_fails_construction() {
        let backend = MemoryBackend::realtime();
        backend.set_output_available(false);
        let err = LoopPlaybackEngine::new(PcmBuffer::new(vec![0; 4]), &backend).unwrap_err();
        assert!(matches!(err, LoopStationError::DeviceUnavailable(_)));
    }
}
