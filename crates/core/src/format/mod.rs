use std::{fmt, sync::Arc, time::Duration};

/// Number of bytes moved between memory and a device in one step. Volume and
/// mute changes take effect at this granularity.
pub const CHUNK_BYTES: usize = 4096;

/// Fixed PCM layout shared by every buffer and device in the station.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    pub channels: u16,
    pub signed: bool,
    pub big_endian: bool,
}

impl PcmFormat {
    /// 44.1 kHz, signed 16-bit little-endian, mono.
    pub const STATION: PcmFormat = PcmFormat {
        sample_rate: 44_100,
        bits_per_sample: 16,
        channels: 1,
        signed: true,
        big_endian: false,
    };

    /// Bytes per frame (one sample on every channel).
    pub const fn frame_size(&self) -> usize {
        (self.bits_per_sample as usize / 8) * self.channels as usize
    }

    /// Bytes the device consumes per second of audio.
    pub const fn bytes_per_second(&self) -> usize {
        self.sample_rate as usize * self.frame_size()
    }

    /// Wall-clock time the device needs to play `bytes` of audio.
    pub fn duration_of(&self, bytes: usize) -> Duration {
        Duration::from_secs_f64(bytes as f64 / self.bytes_per_second() as f64)
    }

    /// Byte count of `duration` worth of audio, rounded down to whole frames.
    pub fn bytes_for(&self, duration: Duration) -> usize {
        let frames = (duration.as_secs_f64() * self.sample_rate as f64) as usize;
        frames * self.frame_size()
    }
}

impl Default for PcmFormat {
    fn default() -> Self {
        Self::STATION
    }
}

impl fmt::Display for PcmFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} Hz, {}-bit {} {}, {} ch",
            self.sample_rate,
            self.bits_per_sample,
            if self.signed { "signed" } else { "unsigned" },
            if self.big_endian { "BE" } else { "LE" },
            self.channels
        )
    }
}

/// Immutable raw PCM bytes in [`PcmFormat::STATION`], no header.
///
/// Cloning is cheap: the bytes live behind an `Arc` so a playback thread can
/// stream them while the owning track keeps its copy.
#[derive(Clone, PartialEq, Eq)]
pub struct PcmBuffer {
    bytes: Arc<[u8]>,
}

impl PcmBuffer {
    /// Takes ownership of raw PCM bytes.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    /// The raw bytes, exactly as captured or loaded.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// True when the buffer holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Playing time of the buffer at the station format.
    pub fn duration(&self) -> Duration {
        PcmFormat::STATION.duration_of(self.len())
    }

    /// Iterates the buffer in [`CHUNK_BYTES`] pieces; the last one may be shorter.
    pub fn chunks(&self) -> std::slice::Chunks<'_, u8> {
        self.bytes.chunks(CHUNK_BYTES)
    }
}

impl From<Vec<u8>> for PcmBuffer {
    fn from(value: Vec<u8>) -> Self {
        Self::new(value)
    }
}

impl AsRef<[u8]> for PcmBuffer {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl fmt::Debug for PcmBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PcmBuffer")
            .field("bytes", &self.len())
            .field("duration", &self.duration())
            .finish()
    }
}

/// Scales one sample, saturating at the 16-bit range instead of wrapping.
#[inline]
pub fn scale_sample(sample: i16, volume: f32) -> i16 {
    let scaled = f32::from(sample) * volume.clamp(0.0, 1.0);
    scaled.clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16
}

/// Applies `volume` to every little-endian sample of `input`, writing into
/// `output` (resized to the input length). A trailing odd byte is emitted as
/// zero since it does not hold a whole sample.
pub fn apply_gain(input: &[u8], volume: f32, output: &mut Vec<u8>) {
    output.clear();
    output.resize(input.len(), 0);

    for (src, dst) in input.chunks_exact(2).zip(output.chunks_exact_mut(2)) {
        let sample = i16::from_le_bytes([src[0], src[1]]);
        dst.copy_from_slice(&scale_sample(sample, volume).to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn station_format_constants() {
        let format = PcmFormat::STATION;
        assert_eq!(format.frame_size(), 2);
        assert_eq!(format.bytes_per_second(), 88_200);
        // one chunk is ~46 ms of audio
        let chunk = format.duration_of(CHUNK_BYTES);
        assert!(chunk > Duration::from_millis(46) && chunk < Duration::from_millis(47));
    }

    #[test]
    fn bytes_for_rounds_to_frames() {
        let format = PcmFormat::STATION;
        assert_eq!(format.bytes_for(Duration::from_secs(2)), 176_400);
        assert_eq!(format.bytes_for(Duration::from_micros(30)) % 2, 0);
    }

    #[test]
    fn scaled_samples_stay_in_range() {
        let samples = [i16::MIN, -12_345, -1, 0, 1, 12_345, i16::MAX];
        for volume in [0.0_f32, 0.25, 0.5, 0.999, 1.0, 1.5, -0.3] {
            for &s in &samples {
                let scaled = i32::from(scale_sample(s, volume));
                assert!((i32::from(i16::MIN)..=i32::from(i16::MAX)).contains(&scaled));
                assert!(scaled.abs() <= i32::from(s).abs());
            }
        }
    }

    #[test]
    fn unity_gain_is_bit_exact() {
        let input: Vec<u8> = (i16::MIN..=i16::MAX)
            .step_by(7)
            .flat_map(i16::to_le_bytes)
            .collect();
        let mut output = Vec::new();
        apply_gain(&input, 1.0, &mut output);
        assert_eq!(input, output);
    }

    #[test]
    fn half_gain_halves_samples() {
        let input: Vec<u8> = [1000_i16, -1000, i16::MIN]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let mut output = Vec::new();
        apply_gain(&input, 0.5, &mut output);

        let decoded: Vec<i16> = output
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        assert_eq!(decoded, vec![500, -500, -16_384]);
    }

    #[test]
    fn odd_trailing_byte_is_zeroed() {
        let mut output = Vec::new();
        apply_gain(&[0x10, 0x00, 0x7f], 1.0, &mut output);
        assert_eq!(output, vec![0x10, 0x00, 0x00]);
    }

    #[test]
    fn buffer_chunks_cover_all_bytes() {
        let buffer = PcmBuffer::new(vec![1; CHUNK_BYTES * 2 + 10]);
        let sizes: Vec<usize> = buffer.chunks().map(<[u8]>::len).collect();
        assert_eq!(sizes, vec![CHUNK_BYTES, CHUNK_BYTES, 10]);
    }
}
