//! Audio frame filters
//!
//! Filters installed on a media patch: silence detection (suppresses
//! transmission between talk spurts), DTMF detection on linear PCM via
//! Goertzel, in-band DTMF injection (replaces payload samples with a
//! generated tone), and a recording tap. Frames are 16 bit little endian
//! linear PCM unless stated otherwise.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, trace};

use tandem_rtp_core::packet::RtpPacket;

use crate::dtmf::{synthesize_digit, COLUMN_FREQUENCIES, KEYPAD, ROW_FREQUENCIES};
use crate::stream::patch::{FilterAction, FilterFn};

/// Decode a PCM-16 payload into samples
pub fn payload_to_samples(payload: &[u8]) -> Vec<i16> {
    payload
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Encode samples into a PCM-16 payload
pub fn samples_to_payload(samples: &[i16]) -> Bytes {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    Bytes::from(bytes)
}

fn frame_energy(samples: &[i16]) -> u32 {
    if samples.is_empty() {
        return 0;
    }
    let total: u64 = samples.iter().map(|&s| (s as i64).unsigned_abs()).sum();
    (total / samples.len() as u64) as u32
}

// ---------------------------------------------------------------------
// Silence detection
// ---------------------------------------------------------------------

/// Silence detector operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SilenceDetectMode {
    /// Detector off, every frame passes
    None,
    /// Frames below this mean-amplitude threshold are silence
    Fixed(u32),
    /// Threshold tracks the observed signal and noise levels
    Adaptive,
}

struct SilenceState {
    threshold: u32,
    in_talk_spurt: bool,
    hangover_left: u32,
    frames_suppressed: u64,
}

/// Suppresses frames between talk spurts.
///
/// After speech ends a hangover of a few frames still passes so words are
/// not clipped; the first frame of a new spurt gets the marker bit.
pub struct SilenceDetector {
    mode: SilenceDetectMode,
    hangover_frames: u32,
    state: Mutex<SilenceState>,
}

impl SilenceDetector {
    /// Detector with the default 4 frame hangover
    pub fn new(mode: SilenceDetectMode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            hangover_frames: 4,
            state: Mutex::new(SilenceState {
                threshold: match mode {
                    SilenceDetectMode::Fixed(threshold) => threshold,
                    _ => 200,
                },
                in_talk_spurt: false,
                hangover_left: 0,
                frames_suppressed: 0,
            }),
        })
    }

    /// Frames swallowed so far
    pub fn frames_suppressed(&self) -> u64 {
        self.state.lock().frames_suppressed
    }

    /// Decide one frame; may set the marker on a spurt start
    pub fn process(&self, packet: &mut RtpPacket) -> FilterAction {
        if self.mode == SilenceDetectMode::None {
            return FilterAction::Forward;
        }

        let samples = payload_to_samples(&packet.payload);
        let energy = frame_energy(&samples);
        let mut state = self.state.lock();

        let loud = energy > state.threshold;

        if self.mode == SilenceDetectMode::Adaptive {
            // Track towards the signal during speech, towards the noise
            // floor during silence
            if loud {
                state.threshold += (energy - state.threshold) / 16;
            } else {
                state.threshold -= (state.threshold - energy.min(state.threshold)) / 32;
            }
            state.threshold = state.threshold.clamp(50, 10_000);
        }

        if loud {
            if !state.in_talk_spurt {
                // Talk spurt restarts mark the timestamp discontinuity
                packet.header.marker = true;
                trace!("Talk spurt started, energy {}", energy);
            }
            state.in_talk_spurt = true;
            state.hangover_left = self.hangover_frames;
            FilterAction::Forward
        } else if state.hangover_left > 0 {
            state.hangover_left -= 1;
            FilterAction::Forward
        } else {
            state.in_talk_spurt = false;
            state.frames_suppressed += 1;
            FilterAction::Drop
        }
    }

    /// Wrap as a patch filter
    pub fn into_filter(self: Arc<Self>) -> FilterFn {
        Arc::new(move |packet: &mut RtpPacket| self.process(packet))
    }
}

// ---------------------------------------------------------------------
// DTMF detection (Goertzel)
// ---------------------------------------------------------------------

/// Goertzel block size at 8 kHz; balances resolution and latency
const GOERTZEL_BLOCK: usize = 205;

/// Relative dominance a tone pair needs over total block energy
const DETECT_RATIO: f32 = 0.7;

fn goertzel_power(samples: &[i16], sample_rate: f32, frequency: f32) -> f32 {
    let k = (0.5 + samples.len() as f32 * frequency / sample_rate).floor();
    let omega = 2.0 * std::f32::consts::PI * k / samples.len() as f32;
    let coeff = 2.0 * omega.cos();

    let mut q1 = 0.0f32;
    let mut q2 = 0.0f32;
    for &sample in samples {
        let q0 = coeff * q1 - q2 + sample as f32;
        q2 = q1;
        q1 = q0;
    }
    q1 * q1 + q2 * q2 - coeff * q1 * q2
}

struct DtmfState {
    window: Vec<i16>,
    last_digit: Option<char>,
    digits: Vec<char>,
}

/// Detects DTMF digits in linear PCM frames.
///
/// Runs the Goertzel algorithm over fixed blocks; a digit is reported
/// once per key press (edge triggered on digit change or release).
pub struct DtmfDetector {
    sample_rate: f32,
    callback: Mutex<Option<Arc<dyn Fn(char) + Send + Sync>>>,
    state: Mutex<DtmfState>,
}

impl DtmfDetector {
    /// Detector for 8 kHz PCM
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sample_rate: 8000.0,
            callback: Mutex::new(None),
            state: Mutex::new(DtmfState {
                window: Vec::with_capacity(GOERTZEL_BLOCK),
                last_digit: None,
                digits: Vec::new(),
            }),
        })
    }

    /// Register the digit callback
    pub fn on_digit(&self, callback: Arc<dyn Fn(char) + Send + Sync>) {
        *self.callback.lock() = Some(callback);
    }

    /// Digits detected so far
    pub fn digits(&self) -> Vec<char> {
        self.state.lock().digits.clone()
    }

    fn classify(&self, block: &[i16]) -> Option<char> {
        let total: f32 = ROW_FREQUENCIES
            .iter()
            .chain(COLUMN_FREQUENCIES.iter())
            .map(|&f| goertzel_power(block, self.sample_rate, f))
            .sum();
        if total <= f32::EPSILON {
            return None;
        }

        let row_powers: Vec<f32> = ROW_FREQUENCIES
            .iter()
            .map(|&f| goertzel_power(block, self.sample_rate, f))
            .collect();
        let column_powers: Vec<f32> = COLUMN_FREQUENCIES
            .iter()
            .map(|&f| goertzel_power(block, self.sample_rate, f))
            .collect();

        let (row, row_power) = row_powers
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))?;
        let (column, column_power) = column_powers
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))?;

        // A valid digit concentrates its energy in exactly one row and
        // one column frequency
        if (row_power + column_power) / total < DETECT_RATIO {
            return None;
        }
        Some(KEYPAD[row][column])
    }

    /// Feed one frame; detection is transparent (always forwards)
    pub fn process(&self, packet: &mut RtpPacket) -> FilterAction {
        let samples = payload_to_samples(&packet.payload);
        let mut state = self.state.lock();
        state.window.extend_from_slice(&samples);

        while state.window.len() >= GOERTZEL_BLOCK {
            let block: Vec<i16> = state.window.drain(..GOERTZEL_BLOCK).collect();
            let digit = self.classify(&block);
            if digit != state.last_digit {
                if let Some(digit) = digit {
                    debug!("DTMF digit '{}' detected", digit);
                    state.digits.push(digit);
                    if let Some(callback) = self.callback.lock().clone() {
                        callback(digit);
                    }
                }
                state.last_digit = digit;
            }
        }
        FilterAction::Forward
    }

    /// Wrap as a patch filter
    pub fn into_filter(self: Arc<Self>) -> FilterFn {
        Arc::new(move |packet: &mut RtpPacket| self.process(packet))
    }
}

// ---------------------------------------------------------------------
// In-band DTMF injection
// ---------------------------------------------------------------------

struct InjectorState {
    /// Remaining (digit, samples-left) queue
    pending: Vec<(char, usize)>,
    /// Sample position inside the current digit
    position: usize,
}

/// Replaces outgoing payloads with generated DTMF tones while a digit is
/// queued; the stream's own frames resume afterwards.
pub struct DtmfInjector {
    sample_rate: u32,
    state: Mutex<InjectorState>,
}

impl DtmfInjector {
    /// Injector for 8 kHz PCM
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sample_rate: 8000,
            state: Mutex::new(InjectorState { pending: Vec::new(), position: 0 }),
        })
    }

    /// Queue a digit for the given duration in milliseconds
    pub fn queue_digit(&self, digit: char, duration_ms: u32) {
        let samples = (self.sample_rate * duration_ms / 1000) as usize;
        self.state.lock().pending.push((digit, samples));
    }

    /// True while a tone is still being injected
    pub fn is_active(&self) -> bool {
        !self.state.lock().pending.is_empty()
    }

    /// Overwrite one frame with tone samples when a digit is active
    pub fn process(&self, packet: &mut RtpPacket) -> FilterAction {
        let frame_samples = packet.payload.len() / 2;
        if frame_samples == 0 {
            return FilterAction::Forward;
        }

        let mut state = self.state.lock();
        let Some(&(digit, total)) = state.pending.first() else {
            return FilterAction::Forward;
        };

        let take = frame_samples.min(total - state.position);
        let offset = state.position;
        state.position += take;
        let finished = state.position >= total;
        if finished {
            state.pending.remove(0);
            state.position = 0;
        }
        drop(state);

        if let Some(tone) = synthesize_digit(digit, self.sample_rate, offset + take) {
            let mut samples = tone[offset..offset + take].to_vec();
            samples.resize(frame_samples, 0);
            packet.payload = samples_to_payload(&samples);
        }
        FilterAction::Forward
    }

    /// Wrap as a patch filter
    pub fn into_filter(self: Arc<Self>) -> FilterFn {
        Arc::new(move |packet: &mut RtpPacket| self.process(packet))
    }
}

// ---------------------------------------------------------------------
// Recording tap
// ---------------------------------------------------------------------

/// Filter that copies every payload into a shared buffer and forwards
pub fn recording_tap(buffer: Arc<Mutex<Vec<u8>>>) -> FilterFn {
    Arc::new(move |packet: &mut RtpPacket| {
        buffer.lock().extend_from_slice(&packet.payload);
        FilterAction::Forward
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tandem_rtp_core::packet::RtpHeader;

    fn pcm_frame(samples: &[i16]) -> RtpPacket {
        RtpPacket::new(RtpHeader::new(0, 1, 0, 1), samples_to_payload(samples))
    }

    fn loud_frame(len: usize) -> RtpPacket {
        pcm_frame(&vec![8000i16; len])
    }

    fn quiet_frame(len: usize) -> RtpPacket {
        pcm_frame(&vec![10i16; len])
    }

    #[test]
    fn test_sample_codec_round_trip() {
        let samples = vec![0i16, -1, 32767, -32768, 42];
        let payload = samples_to_payload(&samples);
        assert_eq!(payload_to_samples(&payload), samples);
    }

    #[test]
    fn test_silence_detector_fixed_mode() {
        let detector = SilenceDetector::new(SilenceDetectMode::Fixed(500));

        // Speech passes and starts a spurt
        let mut frame = loud_frame(160);
        assert_eq!(detector.process(&mut frame), FilterAction::Forward);
        assert!(frame.header.marker);

        // Hangover frames still pass after speech stops
        for _ in 0..4 {
            assert_eq!(detector.process(&mut quiet_frame(160)), FilterAction::Forward);
        }
        // Then silence is suppressed
        assert_eq!(detector.process(&mut quiet_frame(160)), FilterAction::Drop);
        assert_eq!(detector.frames_suppressed(), 1);

        // New speech restarts the spurt with a fresh marker
        let mut restart = loud_frame(160);
        assert_eq!(detector.process(&mut restart), FilterAction::Forward);
        assert!(restart.header.marker);
    }

    #[test]
    fn test_silence_detector_off() {
        let detector = SilenceDetector::new(SilenceDetectMode::None);
        for _ in 0..20 {
            assert_eq!(detector.process(&mut quiet_frame(160)), FilterAction::Forward);
        }
    }

    #[test]
    fn test_dtmf_detector_finds_digit() {
        let detector = DtmfDetector::new();
        let tone = synthesize_digit('5', 8000, 820).unwrap();

        // Feed as 160 sample frames
        for chunk in tone.chunks(160) {
            detector.process(&mut pcm_frame(chunk));
        }
        assert_eq!(detector.digits(), vec!['5']);
    }

    #[test]
    fn test_dtmf_detector_reports_once_per_press() {
        let detector = DtmfDetector::new();
        let tone = synthesize_digit('7', 8000, 1640).unwrap();
        for chunk in tone.chunks(160) {
            detector.process(&mut pcm_frame(chunk));
        }
        // Long press still yields exactly one report
        assert_eq!(detector.digits(), vec!['7']);
    }

    #[test]
    fn test_dtmf_detector_ignores_silence_and_speechlike() {
        let detector = DtmfDetector::new();
        for _ in 0..10 {
            detector.process(&mut quiet_frame(205));
        }
        // Pseudo random noise
        let noise: Vec<i16> =
            (0..2050).map(|n| ((n * 7919 + 104729) % 16384) as i16 - 8192).collect();
        for chunk in noise.chunks(205) {
            detector.process(&mut pcm_frame(chunk));
        }
        assert!(detector.digits().is_empty());
    }

    #[test]
    fn test_dtmf_callback_invoked() {
        let detector = DtmfDetector::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        detector.on_digit(Arc::new(move |digit| sink.lock().push(digit)));

        let tone = synthesize_digit('#', 8000, 820).unwrap();
        for chunk in tone.chunks(160) {
            detector.process(&mut pcm_frame(chunk));
        }
        assert_eq!(&*seen.lock(), &['#']);
    }

    #[test]
    fn test_injector_replaces_payload_then_stops() {
        let injector = DtmfInjector::new();
        injector.queue_digit('2', 20); // 160 samples at 8 kHz

        let mut frame = quiet_frame(160);
        let original = frame.payload.clone();
        injector.process(&mut frame);
        assert_ne!(frame.payload, original);
        assert!(!injector.is_active());

        // Queue drained: later frames pass untouched
        let mut after = quiet_frame(160);
        let untouched = after.payload.clone();
        injector.process(&mut after);
        assert_eq!(after.payload, untouched);
    }

    #[test]
    fn test_injector_spans_frames() {
        let injector = DtmfInjector::new();
        injector.queue_digit('9', 40); // 320 samples, two 160 sample frames

        injector.process(&mut quiet_frame(160));
        assert!(injector.is_active());
        injector.process(&mut quiet_frame(160));
        assert!(!injector.is_active());
    }

    #[test]
    fn test_recording_tap() {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let tap = recording_tap(buffer.clone());

        let mut frame = pcm_frame(&[1, 2, 3]);
        assert_eq!(tap(&mut frame), FilterAction::Forward);
        assert_eq!(buffer.lock().len(), 6);
    }
}
