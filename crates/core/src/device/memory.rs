//! In-process devices for tests and headless runs.
//!
//! Inputs synthesise silence or a sine tone, outputs count the bytes they
//! accept. With [`Pacing::RealTime`] every read and write takes the wall-clock
//! time the audio represents, which is how a hardware device behaves.

use std::{
    f64::consts::TAU,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread,
};

use serde::{Deserialize, Serialize};

use super::{AudioBackend, DeviceInfo, DeviceRole, InputDevice, OutputDevice, PcmReader, PcmWriter};
use crate::{LoopStationError, PcmFormat, Result};

const NEVER: usize = usize::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pacing {
    /// Reads and writes block for the duration of the audio they carry.
    RealTime,
    /// Reads and writes return immediately.
    Unpaced,
}

/// Signal produced by the memory input device.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MemoryInput {
    Silence,
    Tone { frequency_hz: f32, amplitude: f32 },
}

impl Default for MemoryInput {
    fn default() -> Self {
        Self::Silence
    }
}

#[derive(Debug)]
struct Shared {
    pacing: Pacing,
    input: MemoryInput,
    format: PcmFormat,
    has_input: AtomicBool,
    has_output: AtomicBool,
    input_in_use: AtomicBool,
    input_fault_after: AtomicUsize,
    output_fault_after: AtomicUsize,
    outputs_opened: AtomicUsize,
    outputs_open: AtomicUsize,
    outputs_running: AtomicUsize,
    writers_active: AtomicUsize,
    bytes_written: AtomicUsize,
    tap: Mutex<Tap>,
}

/// Copy of the bytes written to outputs, up to `limit`.
#[derive(Debug, Default)]
struct Tap {
    limit: usize,
    bytes: Vec<u8>,
}

impl Shared {
    fn pace(&self, bytes: usize) {
        if self.pacing == Pacing::RealTime {
            thread::sleep(self.format.duration_of(bytes));
        }
    }
}

/// Backend whose devices live entirely in memory.
///
/// Clones share the same counters, so a test can keep one clone for
/// inspection and hand another to the station.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    shared: Arc<Shared>,
}

impl MemoryBackend {
    pub fn new(pacing: Pacing, input: MemoryInput) -> Self {
        Self {
            shared: Arc::new(Shared {
                pacing,
                input,
                format: PcmFormat::STATION,
                has_input: AtomicBool::new(true),
                has_output: AtomicBool::new(true),
                input_in_use: AtomicBool::new(false),
                input_fault_after: AtomicUsize::new(NEVER),
                output_fault_after: AtomicUsize::new(NEVER),
                outputs_opened: AtomicUsize::new(0),
                outputs_open: AtomicUsize::new(0),
                outputs_running: AtomicUsize::new(0),
                writers_active: AtomicUsize::new(0),
                bytes_written: AtomicUsize::new(0),
                tap: Mutex::new(Tap::default()),
            }),
        }
    }

    /// Real-time silence, the closest stand-in for an idle microphone.
    pub fn realtime() -> Self {
        Self::new(Pacing::RealTime, MemoryInput::Silence)
    }

    pub fn set_input_available(&self, available: bool) {
        self.shared.has_input.store(available, Ordering::Release);
    }

    pub fn set_output_available(&self, available: bool) {
        self.shared.has_output.store(available, Ordering::Release);
    }

    /// Input devices opened from now on fail after `frames` successful reads.
    pub fn fail_input_after(&self, frames: usize) {
        self.shared.input_fault_after.store(frames, Ordering::Release);
    }

    /// Output devices opened from now on fail after `chunks` successful writes.
    pub fn fail_output_after(&self, chunks: usize) {
        self.shared.output_fault_after.store(chunks, Ordering::Release);
    }

    pub fn outputs_opened(&self) -> usize {
        self.shared.outputs_opened.load(Ordering::Acquire)
    }

    /// Output devices opened and not yet dropped.
    pub fn outputs_open(&self) -> usize {
        self.shared.outputs_open.load(Ordering::Acquire)
    }

    /// Output devices currently started.
    pub fn outputs_running(&self) -> usize {
        self.shared.outputs_running.load(Ordering::Acquire)
    }

    /// Writer handles held by playback threads right now.
    pub fn writers_active(&self) -> usize {
        self.shared.writers_active.load(Ordering::Acquire)
    }

    pub fn input_in_use(&self) -> bool {
        self.shared.input_in_use.load(Ordering::Acquire)
    }

    pub fn bytes_written(&self) -> usize {
        self.shared.bytes_written.load(Ordering::Acquire)
    }

    /// Starts keeping a copy of everything written to any output, up to
    /// `limit` bytes. Anything tapped before is discarded.
    pub fn tap_output(&self, limit: usize) {
        if let Ok(mut tap) = self.shared.tap.lock() {
            tap.limit = limit;
            tap.bytes.clear();
        }
    }

    /// Bytes kept since the last [`MemoryBackend::tap_output`], in write order.
    pub fn tapped_output(&self) -> Vec<u8> {
        self.shared
            .tap
            .lock()
            .map(|tap| tap.bytes.clone())
            .unwrap_or_default()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::realtime()
    }
}

impl AudioBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    fn devices(&self) -> Result<Vec<DeviceInfo>> {
        let mut devices = Vec::new();
        if self.shared.has_input.load(Ordering::Acquire) {
            devices.push(DeviceInfo {
                name: "memory input".to_string(),
                role: DeviceRole::Input,
                is_default: true,
            });
        }
        if self.shared.has_output.load(Ordering::Acquire) {
            devices.push(DeviceInfo {
                name: "memory output".to_string(),
                role: DeviceRole::Output,
                is_default: true,
            });
        }
        Ok(devices)
    }

    fn open_input(&self, format: &PcmFormat) -> Result<Box<dyn InputDevice>> {
        check_format(format)?;
        if !self.shared.has_input.load(Ordering::Acquire) {
            return Err(LoopStationError::DeviceUnavailable(
                "no memory input device".to_string(),
            ));
        }
        if self.shared.input_in_use.swap(true, Ordering::AcqRel) {
            return Err(LoopStationError::DeviceUnavailable(
                "memory input device is already in use".to_string(),
            ));
        }

        Ok(Box::new(MemoryInputDevice {
            shared: Arc::clone(&self.shared),
            running: Arc::new(AtomicBool::new(false)),
            reads_left: Arc::new(AtomicUsize::new(
                self.shared.input_fault_after.load(Ordering::Acquire),
            )),
        }))
    }

    fn open_output(&self, format: &PcmFormat) -> Result<Box<dyn OutputDevice>> {
        check_format(format)?;
        if !self.shared.has_output.load(Ordering::Acquire) {
            return Err(LoopStationError::DeviceUnavailable(
                "no memory output device".to_string(),
            ));
        }

        self.shared.outputs_opened.fetch_add(1, Ordering::AcqRel);
        self.shared.outputs_open.fetch_add(1, Ordering::AcqRel);
        Ok(Box::new(MemoryOutputDevice {
            shared: Arc::clone(&self.shared),
            running: false,
            writes_left: Arc::new(AtomicUsize::new(
                self.shared.output_fault_after.load(Ordering::Acquire),
            )),
        }))
    }
}

fn check_format(format: &PcmFormat) -> Result<()> {
    if *format == PcmFormat::STATION {
        Ok(())
    } else {
        Err(LoopStationError::DeviceUnavailable(format!(
            "memory devices only support {}",
            PcmFormat::STATION
        )))
    }
}

/// Takes one unit from a fault budget; false once the budget is spent.
fn take_budget(budget: &AtomicUsize) -> bool {
    budget
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| match left {
            NEVER => Some(NEVER),
            0 => None,
            n => Some(n - 1),
        })
        .is_ok()
}

struct MemoryInputDevice {
    shared: Arc<Shared>,
    running: Arc<AtomicBool>,
    reads_left: Arc<AtomicUsize>,
}

impl InputDevice for MemoryInputDevice {
    fn start(&mut self) -> Result<()> {
        self.running.store(true, Ordering::Release);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.running.store(false, Ordering::Release);
        Ok(())
    }

    fn reader(&self) -> Box<dyn PcmReader> {
        Box::new(MemoryReader {
            shared: Arc::clone(&self.shared),
            running: Arc::clone(&self.running),
            reads_left: Arc::clone(&self.reads_left),
            phase: 0.0,
        })
    }
}

impl Drop for MemoryInputDevice {
    fn drop(&mut self) {
        self.shared.input_in_use.store(false, Ordering::Release);
    }
}

struct MemoryReader {
    shared: Arc<Shared>,
    running: Arc<AtomicBool>,
    reads_left: Arc<AtomicUsize>,
    phase: f64,
}

impl PcmReader for MemoryReader {
    fn read_frame(&mut self, frame: &mut [u8]) -> Result<usize> {
        if !take_budget(&self.reads_left) {
            return Err(LoopStationError::DeviceFailure(
                "memory input device disconnected".to_string(),
            ));
        }

        self.shared.pace(frame.len());
        if !self.running.load(Ordering::Acquire) {
            return Ok(0);
        }

        match self.shared.input {
            MemoryInput::Silence => frame.fill(0),
            MemoryInput::Tone {
                frequency_hz,
                amplitude,
            } => {
                let step = TAU * f64::from(frequency_hz) / f64::from(self.shared.format.sample_rate);
                let peak = f64::from(amplitude.clamp(0.0, 1.0)) * f64::from(i16::MAX);
                for bytes in frame.chunks_exact_mut(2) {
                    let sample = (self.phase.sin() * peak) as i16;
                    bytes.copy_from_slice(&sample.to_le_bytes());
                    self.phase = (self.phase + step) % TAU;
                }
            }
        }

        Ok(frame.len() - frame.len() % 2)
    }
}

struct MemoryOutputDevice {
    shared: Arc<Shared>,
    running: bool,
    writes_left: Arc<AtomicUsize>,
}

impl OutputDevice for MemoryOutputDevice {
    fn start(&mut self) -> Result<()> {
        if !self.running {
            self.running = true;
            self.shared.outputs_running.fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if self.running {
            self.running = false;
            self.shared.outputs_running.fetch_sub(1, Ordering::AcqRel);
        }
        Ok(())
    }

    fn writer(&self) -> Box<dyn PcmWriter> {
        self.shared.writers_active.fetch_add(1, Ordering::AcqRel);
        Box::new(MemoryWriter {
            shared: Arc::clone(&self.shared),
            writes_left: Arc::clone(&self.writes_left),
        })
    }
}

impl Drop for MemoryOutputDevice {
    fn drop(&mut self) {
        let _ = self.stop();
        self.shared.outputs_open.fetch_sub(1, Ordering::AcqRel);
    }
}

struct MemoryWriter {
    shared: Arc<Shared>,
    writes_left: Arc<AtomicUsize>,
}

impl PcmWriter for MemoryWriter {
    fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        if !take_budget(&self.writes_left) {
            return Err(LoopStationError::DeviceFailure(
                "memory output device disconnected".to_string(),
            ));
        }
        self.shared.pace(chunk.len());
        {
            let mut tap = self
                .shared
                .tap
                .lock()
                .map_err(|_| LoopStationError::Poisoned("memory output tap"))?;
            let room = tap.limit.saturating_sub(tap.bytes.len());
            tap.bytes.extend_from_slice(&chunk[..room.min(chunk.len())]);
        }
        self.shared
            .bytes_written
            .fetch_add(chunk.len(), Ordering::AcqRel);
        Ok(())
    }
}

impl Drop for MemoryWriter {
    fn drop(&mut self) {
        self.shared.writers_active.fetch_sub(1, Ordering::AcqRel);
    }
}
