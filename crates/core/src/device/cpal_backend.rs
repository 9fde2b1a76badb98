//! CPAL device backend.
//!
//! CPAL drives devices from its own callback thread. The blocking contract of
//! [`PcmReader`]/[`PcmWriter`] is layered on top with bounded channels:
//!
//! ```text
//!  capture thread ◄──recv── [bounded queue] ◄──try_send── CPAL input callback
//!  playback thread ──send──► [bounded queue] ──try_recv──► CPAL output callback
//! ```
//!
//! The input callback never blocks: when the capture thread falls behind the
//! frame is dropped and counted. The output queue is two chunks deep, so a
//! playback thread blocks once it is that far ahead of the device.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, Device, SampleFormat, SampleRate, Stream, StreamConfig};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};

use super::{AudioBackend, DeviceInfo, DeviceRole, InputDevice, OutputDevice, PcmReader, PcmWriter};
use crate::{LoopStationError, PcmFormat, Result};

const INPUT_QUEUE_DEPTH: usize = 64;
const OUTPUT_QUEUE_DEPTH: usize = 2;
const FAULT_POLL: Duration = Duration::from_millis(100);

/// Backend over the default CPAL host.
#[derive(Debug, Clone, Default)]
pub struct CpalBackend {
    input_device: Option<String>,
    output_device: Option<String>,
}

impl CpalBackend {
    /// `None` selects the host's default device for that direction.
    pub fn new(input_device: Option<String>, output_device: Option<String>) -> Self {
        Self {
            input_device,
            output_device,
        }
    }
}

impl AudioBackend for CpalBackend {
    fn name(&self) -> &str {
        "cpal"
    }

    fn devices(&self) -> Result<Vec<DeviceInfo>> {
        let host = cpal::default_host();
        let default_input = host.default_input_device().and_then(|d| d.name().ok());
        let default_output = host.default_output_device().and_then(|d| d.name().ok());

        let mut devices = Vec::new();
        let inputs = host
            .input_devices()
            .map_err(|e| LoopStationError::DeviceUnavailable(e.to_string()))?;
        for device in inputs {
            let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
            devices.push(DeviceInfo {
                is_default: default_input.as_deref() == Some(name.as_str()),
                name,
                role: DeviceRole::Input,
            });
        }

        let outputs = host
            .output_devices()
            .map_err(|e| LoopStationError::DeviceUnavailable(e.to_string()))?;
        for device in outputs {
            let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
            devices.push(DeviceInfo {
                is_default: default_output.as_deref() == Some(name.as_str()),
                name,
                role: DeviceRole::Output,
            });
        }

        Ok(devices)
    }

    fn open_input(&self, format: &PcmFormat) -> Result<Box<dyn InputDevice>> {
        let device = find_device(DeviceRole::Input, self.input_device.as_deref())?;
        let config = stream_config(&device, DeviceRole::Input, format)?;
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());

        let (tx, rx) = bounded::<Vec<u8>>(INPUT_QUEUE_DEPTH);
        let fault = Arc::new(Mutex::new(None));
        let dropped = Arc::new(AtomicUsize::new(0));
        let running = Arc::new(AtomicBool::new(false));

        let stream = {
            let dropped = Arc::clone(&dropped);
            device
                .build_input_stream(
                    &config,
                    move |data: &[i16], _: &cpal::InputCallbackInfo| {
                        let bytes: Vec<u8> = data.iter().flat_map(|s| s.to_le_bytes()).collect();
                        if tx.try_send(bytes).is_err() {
                            dropped.fetch_add(data.len(), Ordering::Relaxed);
                        }
                    },
                    fault_callback(Arc::clone(&fault)),
                    None,
                )
                .map_err(|e| LoopStationError::DeviceUnavailable(format!("{name}: {e}")))?
        };
        // Some hosts start streams on build.
        let _ = stream.pause();

        tracing::info!(device = %name, "opened capture device");
        Ok(Box::new(CpalInput {
            stream,
            receiver: rx,
            fault,
            dropped,
            running,
        }))
    }

    fn open_output(&self, format: &PcmFormat) -> Result<Box<dyn OutputDevice>> {
        let device = find_device(DeviceRole::Output, self.output_device.as_deref())?;
        let config = stream_config(&device, DeviceRole::Output, format)?;
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());

        let (tx, rx) = bounded::<Vec<i16>>(OUTPUT_QUEUE_DEPTH);
        let fault = Arc::new(Mutex::new(None));

        let stream = {
            let rx = rx.clone();
            let mut pending: VecDeque<i16> = VecDeque::new();
            device
                .build_output_stream(
                    &config,
                    move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                        for out in data.iter_mut() {
                            if pending.is_empty() {
                                if let Ok(chunk) = rx.try_recv() {
                                    pending.extend(chunk);
                                }
                            }
                            // underrun plays silence
                            *out = pending.pop_front().unwrap_or(0);
                        }
                    },
                    fault_callback(Arc::clone(&fault)),
                    None,
                )
                .map_err(|e| LoopStationError::DeviceUnavailable(format!("{name}: {e}")))?
        };
        let _ = stream.pause();

        tracing::debug!(device = %name, "opened playback device");
        Ok(Box::new(CpalOutput {
            stream,
            sender: tx,
            receiver: rx,
            fault,
        }))
    }
}

fn find_device(role: DeviceRole, wanted: Option<&str>) -> Result<Device> {
    let host = cpal::default_host();
    let found = match (role, wanted) {
        (DeviceRole::Input, None) => host.default_input_device(),
        (DeviceRole::Output, None) => host.default_output_device(),
        (DeviceRole::Input, Some(name)) => host
            .input_devices()
            .map_err(|e| LoopStationError::DeviceUnavailable(e.to_string()))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false)),
        (DeviceRole::Output, Some(name)) => host
            .output_devices()
            .map_err(|e| LoopStationError::DeviceUnavailable(e.to_string()))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false)),
    };

    found.ok_or_else(|| {
        LoopStationError::DeviceUnavailable(match wanted {
            Some(name) => format!("no {role:?} device named `{name}`").to_lowercase(),
            None => format!("no default {role:?} device").to_lowercase(),
        })
    })
}

/// Accepts the device only if it can run `format` exactly.
fn stream_config(device: &Device, role: DeviceRole, format: &PcmFormat) -> Result<StreamConfig> {
    if format.bits_per_sample != 16 || !format.signed || format.big_endian {
        return Err(LoopStationError::DeviceUnavailable(format!(
            "unsupported sample layout: {format}"
        )));
    }

    let ranges: Vec<_> = match role {
        DeviceRole::Input => device
            .supported_input_configs()
            .map_err(|e| LoopStationError::DeviceUnavailable(e.to_string()))?
            .collect(),
        DeviceRole::Output => device
            .supported_output_configs()
            .map_err(|e| LoopStationError::DeviceUnavailable(e.to_string()))?
            .collect(),
    };

    let rate = SampleRate(format.sample_rate);
    let supported = ranges.iter().any(|range| {
        range.channels() == format.channels
            && range.sample_format() == SampleFormat::I16
            && range.min_sample_rate() <= rate
            && rate <= range.max_sample_rate()
    });

    if !supported {
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        return Err(LoopStationError::DeviceUnavailable(format!(
            "{name} does not support {format}"
        )));
    }

    Ok(StreamConfig {
        channels: format.channels,
        sample_rate: rate,
        buffer_size: BufferSize::Default,
    })
}

fn fault_callback(fault: Arc<Mutex<Option<String>>>) -> impl FnMut(cpal::StreamError) + Send + 'static {
    move |err| {
        if let Ok(mut slot) = fault.lock() {
            slot.get_or_insert_with(|| err.to_string());
        }
    }
}

fn current_fault(fault: &Mutex<Option<String>>) -> Option<String> {
    fault.lock().ok().and_then(|slot| slot.clone())
}

struct CpalInput {
    stream: Stream,
    receiver: Receiver<Vec<u8>>,
    fault: Arc<Mutex<Option<String>>>,
    dropped: Arc<AtomicUsize>,
    running: Arc<AtomicBool>,
}

impl InputDevice for CpalInput {
    fn start(&mut self) -> Result<()> {
        self.stream
            .play()
            .map_err(|e| LoopStationError::DeviceFailure(e.to_string()))?;
        self.running.store(true, Ordering::Release);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.running.store(false, Ordering::Release);
        self.stream
            .pause()
            .map_err(|e| LoopStationError::DeviceFailure(e.to_string()))?;

        let dropped = self.dropped.swap(0, Ordering::Relaxed);
        if dropped > 0 {
            tracing::warn!(samples = dropped, "capture fell behind the input device");
        }
        Ok(())
    }

    fn reader(&self) -> Box<dyn PcmReader> {
        Box::new(CpalReader {
            receiver: self.receiver.clone(),
            fault: Arc::clone(&self.fault),
            running: Arc::clone(&self.running),
            pending: VecDeque::new(),
        })
    }
}

struct CpalReader {
    receiver: Receiver<Vec<u8>>,
    fault: Arc<Mutex<Option<String>>>,
    running: Arc<AtomicBool>,
    pending: VecDeque<u8>,
}

impl PcmReader for CpalReader {
    fn read_frame(&mut self, frame: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < frame.len() {
            if self.pending.is_empty() {
                match self.receiver.recv_timeout(FAULT_POLL) {
                    Ok(bytes) => self.pending.extend(bytes),
                    Err(RecvTimeoutError::Timeout) => {
                        if let Some(fault) = current_fault(&self.fault) {
                            return Err(LoopStationError::DeviceFailure(fault));
                        }
                        if !self.running.load(Ordering::Acquire) {
                            break;
                        }
                        continue;
                    }
                    Err(RecvTimeoutError::Disconnected) => {
                        return Err(LoopStationError::DeviceFailure(
                            "input stream closed".to_string(),
                        ));
                    }
                }
            }

            let take = self.pending.len().min(frame.len() - filled);
            for (dst, src) in frame[filled..filled + take]
                .iter_mut()
                .zip(self.pending.drain(..take))
            {
                *dst = src;
            }
            filled += take;
        }
        Ok(filled)
    }
}

struct CpalOutput {
    stream: Stream,
    sender: Sender<Vec<i16>>,
    receiver: Receiver<Vec<i16>>,
    fault: Arc<Mutex<Option<String>>>,
}

impl OutputDevice for CpalOutput {
    fn start(&mut self) -> Result<()> {
        self.stream
            .play()
            .map_err(|e| LoopStationError::DeviceFailure(e.to_string()))
    }

    fn stop(&mut self) -> Result<()> {
        self.stream
            .pause()
            .map_err(|e| LoopStationError::DeviceFailure(e.to_string()))?;
        // queued chunks belong to the stopped run
        while self.receiver.try_recv().is_ok() {}
        Ok(())
    }

    fn writer(&self) -> Box<dyn PcmWriter> {
        Box::new(CpalWriter {
            sender: self.sender.clone(),
            fault: Arc::clone(&self.fault),
        })
    }
}

struct CpalWriter {
    sender: Sender<Vec<i16>>,
    fault: Arc<Mutex<Option<String>>>,
}

impl PcmWriter for CpalWriter {
    fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        let mut samples: Vec<i16> = chunk
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();

        loop {
            match self.sender.send_timeout(samples, FAULT_POLL) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(back)) => {
                    if let Some(fault) = current_fault(&self.fault) {
                        return Err(LoopStationError::DeviceFailure(fault));
                    }
                    samples = back;
                }
                Err(SendTimeoutError::Disconnected(_)) => {
                    return Err(LoopStationError::DeviceFailure(
                        "output stream closed".to_string(),
                    ));
                }
            }
        }
    }
}
