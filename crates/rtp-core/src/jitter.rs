//! Adaptive jitter buffer
//!
//! A bounded reordering queue keyed by RTP timestamp, sitting between the
//! session read loop and the media stream. The playout delay starts at the
//! configured minimum, grows when packets arrive too late to play, and
//! decays back down after a sustained run of comfortably early packets.
//! With both delays zero the buffer is a straight pass-through.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::packet::RtpPacket;
use crate::RtpTimestamp;

/// Consecutive on-time packets before the delay decays one step
const SHRINK_STREAK: u32 = 200;

/// Jitter buffer configuration; delays are in media clock units
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct JitterBufferConfig {
    /// Smallest playout delay
    pub min_delay: u32,

    /// Largest playout delay the buffer will adapt to
    pub max_delay: u32,

    /// Media clock rate in Hz
    pub clock_rate: u32,

    /// Hard bound on queued packets; overruns drop the oldest
    pub max_packets: usize,
}

impl JitterBufferConfig {
    /// Config from delays in milliseconds at the given clock rate
    pub fn from_millis(min_ms: u32, max_ms: u32, clock_rate: u32) -> Self {
        let units_per_ms = (clock_rate / 1000).max(1);
        Self {
            min_delay: min_ms * units_per_ms,
            max_delay: max_ms * units_per_ms,
            clock_rate,
            max_packets: 128,
        }
    }

    /// Both delays zero: buffering disabled entirely
    pub fn is_bypass(&self) -> bool {
        self.min_delay == 0 && self.max_delay == 0
    }
}

impl Default for JitterBufferConfig {
    fn default() -> Self {
        // 50..250 ms at 8 kHz
        Self::from_millis(50, 250, 8000)
    }
}

/// Counters exposed to session statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JitterBufferStats {
    /// Packets currently queued
    pub queued: usize,

    /// Packets that arrived after their playout time
    pub packets_too_late: u64,

    /// Packets dropped because the queue hit its bound
    pub overruns: u64,

    /// Current adaptive delay in clock units
    pub current_delay: u32,
}

/// Outcome of a pull attempt
#[derive(Debug)]
pub enum PullResult {
    /// This packet is due now
    Packet(RtpPacket),

    /// Nothing due yet; retry after this long
    Wait(Duration),

    /// Queue is empty; the reader should wait for an insert and count the
    /// starvation (silence/comfort-noise substitution happens upstream)
    Starved,
}

/// Timestamp-ordered adaptive playout queue
pub struct JitterBuffer {
    config: JitterBufferConfig,
    frames: BTreeMap<RtpTimestamp, RtpPacket>,
    current_delay: u32,
    /// Wall clock moment the timestamp base was established
    wall_base: Option<Instant>,
    timestamp_base: RtpTimestamp,
    last_played: Option<RtpTimestamp>,
    on_time_streak: u32,
    packets_too_late: u64,
    overruns: u64,
}

impl JitterBuffer {
    /// Create a buffer with the initial delay at the configured minimum
    pub fn new(config: JitterBufferConfig) -> Self {
        let current_delay = config.min_delay;
        Self {
            config,
            frames: BTreeMap::new(),
            current_delay,
            wall_base: None,
            timestamp_base: 0,
            last_played: None,
            on_time_streak: 0,
            packets_too_late: 0,
            overruns: 0,
        }
    }

    /// Media clock units per millisecond
    fn units_per_ms(&self) -> u32 {
        (self.config.clock_rate / 1000).max(1)
    }

    /// Clock units elapsed since the base was established
    fn elapsed_units(&self, now: Instant) -> u32 {
        match self.wall_base {
            Some(base) => (now.duration_since(base).as_millis() as u32)
                .wrapping_mul(self.units_per_ms()),
            None => 0,
        }
    }

    /// Queue a packet.
    ///
    /// Late arrivals (already past their playout point) are dropped and
    /// push the delay up; a full queue drops its oldest entry.
    pub fn insert(&mut self, packet: RtpPacket, now: Instant) {
        if self.config.is_bypass() {
            self.frames.insert(packet.header.timestamp, packet);
            return;
        }

        let ts = packet.header.timestamp;

        if self.wall_base.is_none() {
            self.wall_base = Some(now);
            self.timestamp_base = ts;
        }

        // A packet at or before the last played timestamp missed its slot
        if let Some(last) = self.last_played {
            if ts.wrapping_sub(last) > 0x8000_0000 || ts == last {
                self.packets_too_late += 1;
                self.on_time_streak = 0;

                // Too late means the delay is too small; grow by the miss
                let miss = last.wrapping_sub(ts).max(self.units_per_ms());
                let grown = self.current_delay.saturating_add(miss);
                self.current_delay = grown.min(self.config.max_delay);
                debug!(
                    "Late packet ts={} (last played {}), delay now {}",
                    ts, last, self.current_delay
                );
                return;
            }
        }

        if self.frames.len() >= self.config.max_packets {
            if let Some((&oldest, _)) = self.frames.iter().next() {
                self.frames.remove(&oldest);
                self.overruns += 1;
                trace!("Jitter buffer overrun, dropped ts={}", oldest);
            }
        }

        self.frames.insert(ts, packet);

        // Sustained comfortable delivery lets the delay shrink
        self.on_time_streak += 1;
        if self.on_time_streak >= SHRINK_STREAK {
            self.on_time_streak = 0;
            if self.current_delay > self.config.min_delay {
                let step = 20 * self.units_per_ms();
                self.current_delay =
                    self.current_delay.saturating_sub(step).max(self.config.min_delay);
                debug!("Jitter delay relaxed to {}", self.current_delay);
            }
        }
    }

    /// Take the next packet if its playout time has arrived
    pub fn pull(&mut self, now: Instant) -> PullResult {
        if self.config.is_bypass() {
            return match self.frames.pop_first() {
                Some((ts, packet)) => {
                    self.last_played = Some(ts);
                    PullResult::Packet(packet)
                }
                None => PullResult::Starved,
            };
        }

        let Some((&ts, _)) = self.frames.iter().next() else {
            return PullResult::Starved;
        };

        // Playout point: when the frame's timestamp plus the adaptive
        // delay passes on the reconstructed media clock
        let due_units = ts.wrapping_sub(self.timestamp_base).wrapping_add(self.current_delay);
        let elapsed = self.elapsed_units(now);

        if elapsed.wrapping_sub(due_units) < 0x8000_0000 {
            let packet = self.frames.remove(&ts).unwrap();
            self.last_played = Some(ts);
            PullResult::Packet(packet)
        } else {
            let wait_units = due_units.wrapping_sub(elapsed);
            let wait_ms = (wait_units / self.units_per_ms()).max(1);
            PullResult::Wait(Duration::from_millis(wait_ms as u64))
        }
    }

    /// Current counters
    pub fn stats(&self) -> JitterBufferStats {
        JitterBufferStats {
            queued: self.frames.len(),
            packets_too_late: self.packets_too_late,
            overruns: self.overruns,
            current_delay: self.current_delay,
        }
    }

    /// Discard all queued packets, keeping the adaptive state
    pub fn flush(&mut self) {
        self.frames.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::RtpHeader;
    use bytes::Bytes;

    fn packet(ts: RtpTimestamp) -> RtpPacket {
        RtpPacket::new(RtpHeader::new(0, (ts / 160) as u16, ts, 1), Bytes::from_static(b"f"))
    }

    fn config_8k(min_ms: u32, max_ms: u32) -> JitterBufferConfig {
        JitterBufferConfig::from_millis(min_ms, max_ms, 8000)
    }

    #[test]
    fn test_bypass_mode_passes_straight_through() {
        let mut buffer = JitterBuffer::new(config_8k(0, 0));
        assert!(buffer.config.is_bypass());

        let now = Instant::now();
        buffer.insert(packet(160), now);
        buffer.insert(packet(0), now);

        // Immediate delivery in timestamp order, no delay applied
        assert!(matches!(buffer.pull(now), PullResult::Packet(p) if p.header.timestamp == 0));
        assert!(matches!(buffer.pull(now), PullResult::Packet(p) if p.header.timestamp == 160));
        assert!(matches!(buffer.pull(now), PullResult::Starved));
    }

    #[test]
    fn test_reorders_by_timestamp() {
        let mut buffer = JitterBuffer::new(config_8k(20, 100));
        let base = Instant::now();
        buffer.insert(packet(320), base);
        buffer.insert(packet(0), base);
        buffer.insert(packet(160), base);

        // Jump past every playout deadline
        let later = base + Duration::from_millis(500);
        let mut order = Vec::new();
        while let PullResult::Packet(p) = buffer.pull(later) {
            order.push(p.header.timestamp);
        }
        assert_eq!(order, vec![0, 160, 320]);
    }

    #[test]
    fn test_not_due_yet_waits() {
        let mut buffer = JitterBuffer::new(config_8k(50, 200));
        let base = Instant::now();
        buffer.insert(packet(0), base);

        // Immediately after insert the 50ms delay has not passed
        match buffer.pull(base) {
            PullResult::Wait(wait) => assert!(wait >= Duration::from_millis(1)),
            other => panic!("expected Wait, got {:?}", other),
        }

        match buffer.pull(base + Duration::from_millis(60)) {
            PullResult::Packet(p) => assert_eq!(p.header.timestamp, 0),
            other => panic!("expected Packet, got {:?}", other),
        }
    }

    #[test]
    fn test_late_packet_counted_and_delay_grows() {
        let mut buffer = JitterBuffer::new(config_8k(20, 200));
        let base = Instant::now();
        buffer.insert(packet(0), base);
        buffer.insert(packet(160), base);

        let later = base + Duration::from_millis(100);
        let PullResult::Packet(_) = buffer.pull(later) else { panic!() };
        let PullResult::Packet(_) = buffer.pull(later) else { panic!() };

        let before = buffer.stats().current_delay;
        // Timestamp 80 is before the last played 160
        buffer.insert(packet(80), later);

        let stats = buffer.stats();
        assert_eq!(stats.packets_too_late, 1);
        assert!(stats.current_delay > before);
        assert!(stats.current_delay <= buffer.config.max_delay);
    }

    #[test]
    fn test_overrun_drops_oldest() {
        let mut config = config_8k(20, 100);
        config.max_packets = 3;
        let mut buffer = JitterBuffer::new(config);
        let base = Instant::now();

        for i in 0..4u32 {
            buffer.insert(packet(i * 160), base);
        }
        let stats = buffer.stats();
        assert_eq!(stats.queued, 3);
        assert_eq!(stats.overruns, 1);

        // Oldest (ts 0) was the casualty
        let later = base + Duration::from_millis(500);
        let PullResult::Packet(p) = buffer.pull(later) else { panic!() };
        assert_eq!(p.header.timestamp, 160);
    }

    #[test]
    fn test_delay_never_exceeds_max() {
        let mut buffer = JitterBuffer::new(config_8k(20, 60));
        let base = Instant::now();
        buffer.insert(packet(8000), base);
        let later = base + Duration::from_millis(200);
        let PullResult::Packet(_) = buffer.pull(later) else { panic!() };

        // A wildly late packet grows the delay but clamps at max
        buffer.insert(packet(0), later);
        assert_eq!(buffer.stats().packets_too_late, 1);
        assert_eq!(buffer.stats().current_delay, buffer.config.max_delay);
    }
}
