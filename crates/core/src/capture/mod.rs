use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

use crate::{AudioBackend, InputDevice, LoopStationError, PcmBuffer, PcmFormat, PcmReader, Result};

/// Size of one blocking device read.
pub const CAPTURE_FRAME_BYTES: usize = 4096;

/// What the capture thread hands back when it is joined.
struct Captured {
    bytes: Vec<u8>,
    fault: Option<LoopStationError>,
}

enum DeviceState {
    Open(Box<dyn InputDevice>),
    /// Opening failed; every `start()` reports this message.
    Unavailable(String),
    Closed,
}

/// One recording pass over the input device: `Idle → Recording → Idle`.
///
/// The accumulator belongs to the capture thread until `stop()` joins it,
/// so no other thread ever observes a partially captured buffer.
pub struct CaptureSession {
    device: DeviceState,
    stop_flag: Arc<AtomicBool>,
    thread: Option<JoinHandle<Captured>>,
    last: Option<PcmBuffer>,
}

impl CaptureSession {
    /// Opens the input device. A failed open is kept rather than returned so
    /// that `start()` keeps reporting it; see [`CaptureSession::open_error`].
    pub fn open(backend: &dyn AudioBackend) -> Self {
        let device = match backend.open_input(&PcmFormat::STATION) {
            Ok(device) => DeviceState::Open(device),
            Err(err) => {
                tracing::warn!(error = %err, "capture device unavailable");
                DeviceState::Unavailable(match err {
                    LoopStationError::DeviceUnavailable(msg) => msg,
                    other => other.to_string(),
                })
            }
        };

        Self {
            device,
            stop_flag: Arc::new(AtomicBool::new(false)),
            thread: None,
            last: None,
        }
    }

    /// The error `open()` ran into, if any.
    pub fn open_error(&self) -> Option<LoopStationError> {
        match &self.device {
            DeviceState::Unavailable(msg) => Some(LoopStationError::DeviceUnavailable(msg.clone())),
            _ => None,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.thread.is_some()
    }

    /// Starts the capture thread. No-op while already recording.
    pub fn start(&mut self) -> Result<()> {
        if self.is_recording() {
            return Ok(());
        }

        let device = match &mut self.device {
            DeviceState::Open(device) => device,
            DeviceState::Unavailable(msg) => {
                return Err(LoopStationError::DeviceUnavailable(msg.clone()))
            }
            DeviceState::Closed => {
                return Err(LoopStationError::DeviceUnavailable(
                    "capture session already closed".to_string(),
                ))
            }
        };

        device.start()?;
        self.stop_flag.store(false, Ordering::Release);
        let reader = device.reader();
        let stop_flag = Arc::clone(&self.stop_flag);

        let spawned = thread::Builder::new()
            .name("loop-capture".to_string())
            .spawn(move || capture_loop(reader, &stop_flag));

        match spawned {
            Ok(handle) => {
                self.thread = Some(handle);
                tracing::info!("recording started");
                Ok(())
            }
            Err(err) => {
                let _ = device.stop();
                Err(LoopStationError::DeviceFailure(format!(
                    "failed to spawn capture thread: {err}"
                )))
            }
        }
    }

    /// Stops recording, blocks until the capture thread has exited, closes
    /// the device and returns the captured audio.
    ///
    /// Returns `Ok(None)` if nothing was captured or the device never opened.
    /// When called while idle, returns the previous result again.
    pub fn stop(&mut self) -> Result<Option<PcmBuffer>> {
        let Some(handle) = self.thread.take() else {
            return Ok(self.last.clone());
        };

        self.stop_flag.store(true, Ordering::Release);
        let joined = handle.join();

        if let DeviceState::Open(mut device) = std::mem::replace(&mut self.device, DeviceState::Closed) {
            if let Err(err) = device.stop() {
                tracing::warn!(error = %err, "failed to stop capture device");
            }
        }

        let captured = joined.map_err(|_| {
            LoopStationError::DeviceFailure("capture thread panicked".to_string())
        })?;
        if let Some(fault) = captured.fault {
            tracing::warn!(bytes = captured.bytes.len(), error = %fault, "recording aborted by device");
            return Err(fault);
        }

        tracing::info!(bytes = captured.bytes.len(), "recording stopped");
        self.last = (!captured.bytes.is_empty()).then(|| PcmBuffer::new(captured.bytes));
        Ok(self.last.clone())
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        if self.is_recording() {
            if let Err(err) = self.stop() {
                tracing::warn!(error = %err, "capture session dropped with an error");
            }
        }
    }
}

impl std::fmt::Debug for CaptureSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let device = match &self.device {
            DeviceState::Open(_) => "open",
            DeviceState::Unavailable(_) => "unavailable",
            DeviceState::Closed => "closed",
        };
        f.debug_struct("CaptureSession")
            .field("device", &device)
            .field("recording", &self.is_recording())
            .finish()
    }
}

fn capture_loop(mut reader: Box<dyn PcmReader>, stop_flag: &AtomicBool) -> Captured {
    let mut bytes = Vec::new();
    let mut frame = vec![0_u8; CAPTURE_FRAME_BYTES];

    // an in-flight read always completes before the flag is looked at again
    while !stop_flag.load(Ordering::Acquire) {
        match reader.read_frame(&mut frame) {
            Ok(read) => bytes.extend_from_slice(&frame[..read]),
            Err(err) => {
                return Captured {
                    bytes,
                    fault: Some(err),
                }
            }
        }
    }

    Captured { bytes, fault: None }
}
