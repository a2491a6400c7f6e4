//! Per-session send and receive statistics
//!
//! Counters are only ever updated on their owning side: send statistics on
//! the sender path, receive statistics on the receiver path. Inter-packet
//! time accumulators fold into min/avg/max snapshots every statistics
//! interval and the snapshot is handed to the session observer.

use std::time::Instant;

use crate::packet::rtcp::{NtpTimestamp, ReportBlock};
use crate::{RtpSequenceNumber, RtpSsrc, RtpTimestamp};

/// Snapshot of the transmit side
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SenderStats {
    /// Packets sent since session start
    pub packets_sent: u64,

    /// Payload octets sent since session start
    pub octets_sent: u64,

    /// Packets sent with the marker bit
    pub marker_count: u64,

    /// Minimum time between transmitted packets, milliseconds
    pub minimum_send_time: u32,

    /// Average time between transmitted packets, milliseconds
    pub average_send_time: u32,

    /// Maximum time between transmitted packets, milliseconds
    pub maximum_send_time: u32,
}

/// Snapshot of the receive side
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiverStats {
    /// Packets received since session start
    pub packets_received: u64,

    /// Payload octets received since session start
    pub octets_received: u64,

    /// Packets lost, inferred from sequence gaps
    pub packets_lost: u64,

    /// Packets that arrived with an earlier than expected sequence
    pub packets_out_of_order: u64,

    /// Packets discarded by the jitter buffer for arriving too late
    pub packets_too_late: u64,

    /// Packets received with the marker bit
    pub marker_count: u64,

    /// Current interarrival jitter in timestamp units
    pub jitter: u32,

    /// Largest jitter level seen, timestamp units
    pub maximum_jitter: u32,

    /// Minimum time between received packets, milliseconds
    pub minimum_receive_time: u32,

    /// Average time between received packets, milliseconds
    pub average_receive_time: u32,

    /// Maximum time between received packets, milliseconds
    pub maximum_receive_time: u32,
}

/// Rounding protection bits on the scaled jitter accumulator
pub(crate) const JITTER_ROUNDING_BITS: u32 = 4;

/// Transmit side working state
#[derive(Debug)]
pub(crate) struct TxState {
    pub last_sequence: RtpSequenceNumber,
    pub packets_sent: u64,
    pub octets_sent: u64,
    pub marker_count: u64,
    pub last_timestamp: RtpTimestamp,
    pub timestamp_offset: RtpTimestamp,

    // Out-of-band timestamp base, phase locking injected frames to the
    // wall clock
    pub oob_base_established: bool,
    pub oob_timestamp_base: RtpTimestamp,
    pub oob_wall_base: Instant,

    pub last_packet_time: Option<Instant>,
    pub stats_count: u32,
    pub send_time_accum: u64,
    pub min_send_time_accum: u32,
    pub max_send_time_accum: u32,

    pub stats: SenderStats,
}

impl TxState {
    pub fn new(initial_sequence: RtpSequenceNumber) -> Self {
        Self {
            last_sequence: initial_sequence,
            packets_sent: 0,
            octets_sent: 0,
            marker_count: 0,
            last_timestamp: 0,
            timestamp_offset: 0,
            oob_base_established: false,
            oob_timestamp_base: 0,
            oob_wall_base: Instant::now(),
            last_packet_time: None,
            stats_count: 0,
            send_time_accum: 0,
            min_send_time_accum: u32::MAX,
            max_send_time_accum: 0,
            stats: SenderStats::default(),
        }
    }

    /// Fold accumulators into the snapshot; called each statistics interval
    pub fn fold(&mut self, interval: u32) {
        self.stats.packets_sent = self.packets_sent;
        self.stats.octets_sent = self.octets_sent;
        self.stats.marker_count = self.marker_count;
        self.stats.average_send_time = (self.send_time_accum / interval.max(1) as u64) as u32;
        self.stats.maximum_send_time = self.max_send_time_accum;
        self.stats.minimum_send_time =
            if self.min_send_time_accum == u32::MAX { 0 } else { self.min_send_time_accum };
        self.stats_count = 0;
        self.send_time_accum = 0;
        self.min_send_time_accum = u32::MAX;
        self.max_send_time_accum = 0;
    }

    /// Current snapshot with live totals
    pub fn snapshot(&self) -> SenderStats {
        let mut stats = self.stats.clone();
        stats.packets_sent = self.packets_sent;
        stats.octets_sent = self.octets_sent;
        stats.marker_count = self.marker_count;
        stats
    }
}

/// Receive side working state
#[derive(Debug)]
pub(crate) struct RxState {
    pub ssrc_in: RtpSsrc,
    pub expected_sequence: RtpSequenceNumber,
    pub consecutive_out_of_order: u32,
    pub packets_received: u64,
    pub octets_received: u64,
    pub packets_lost: u64,
    pub packets_out_of_order: u64,
    pub packets_too_late: u64,
    pub marker_count: u64,
    pub last_payload_type: Option<u8>,
    pub allow_one_ssrc_change: bool,

    // RFC 3550 scaled jitter accumulator, four rounding protection bits
    pub jitter_level: u32,
    pub maximum_jitter_level: u32,
    pub last_transit: i64,

    pub last_packet_time: Option<Instant>,
    pub stats_count: u32,
    pub receive_time_accum: u64,
    pub min_receive_time_accum: u32,
    pub max_receive_time_accum: u32,

    // Reception report bookkeeping
    pub lost_since_last_rr: u64,
    pub last_rr_sequence: RtpSequenceNumber,
    pub sequence_cycles: u32,
    pub last_sr_ntp: Option<NtpTimestamp>,
    pub last_sr_received: Option<Instant>,

    pub stats: ReceiverStats,
}

impl RxState {
    pub fn new(allow_one_ssrc_change: bool) -> Self {
        Self {
            ssrc_in: 0,
            expected_sequence: 0,
            consecutive_out_of_order: 0,
            packets_received: 0,
            octets_received: 0,
            packets_lost: 0,
            packets_out_of_order: 0,
            packets_too_late: 0,
            marker_count: 0,
            last_payload_type: None,
            allow_one_ssrc_change,
            jitter_level: 0,
            maximum_jitter_level: 0,
            last_transit: 0,
            last_packet_time: None,
            stats_count: 0,
            receive_time_accum: 0,
            min_receive_time_accum: u32::MAX,
            max_receive_time_accum: 0,
            lost_since_last_rr: 0,
            last_rr_sequence: 0,
            sequence_cycles: 0,
            last_sr_ntp: None,
            last_sr_received: None,
            stats: ReceiverStats::default(),
        }
    }

    /// Fold accumulators into the snapshot; called each statistics interval
    pub fn fold(&mut self, interval: u32) {
        self.stats = self.snapshot();
        self.stats.average_receive_time =
            (self.receive_time_accum / interval.max(1) as u64) as u32;
        self.stats.maximum_receive_time = self.max_receive_time_accum;
        self.stats.minimum_receive_time =
            if self.min_receive_time_accum == u32::MAX { 0 } else { self.min_receive_time_accum };
        self.stats_count = 0;
        self.receive_time_accum = 0;
        self.min_receive_time_accum = u32::MAX;
        self.max_receive_time_accum = 0;
    }

    /// Current snapshot with live totals
    pub fn snapshot(&self) -> ReceiverStats {
        let mut stats = self.stats.clone();
        stats.packets_received = self.packets_received;
        stats.octets_received = self.octets_received;
        stats.packets_lost = self.packets_lost;
        stats.packets_out_of_order = self.packets_out_of_order;
        stats.packets_too_late = self.packets_too_late;
        stats.marker_count = self.marker_count;
        stats.jitter = self.jitter_level >> JITTER_ROUNDING_BITS;
        stats.maximum_jitter = self.maximum_jitter_level >> JITTER_ROUNDING_BITS;
        stats
    }

    /// Build the reception report block for the next SR/RR.
    ///
    /// Loss fraction is `lost-since-last-report * 256 / sequence-advance`;
    /// cumulative loss saturates at 24 bits; jitter drops the rounding
    /// protection bits.
    pub fn build_report_block(&mut self) -> ReportBlock {
        let advance = self.expected_sequence.wrapping_sub(self.last_rr_sequence) as u64;
        let fraction = if advance > 0 && self.expected_sequence != self.last_rr_sequence {
            ((self.lost_since_last_rr << 8) / advance).min(255) as u8
        } else {
            0
        };

        let block = ReportBlock {
            ssrc: self.ssrc_in,
            fraction_lost: fraction,
            cumulative_lost: self.packets_lost.min(0x00ff_ffff) as u32,
            highest_sequence: ((self.sequence_cycles as u32) << 16)
                | self.expected_sequence as u32,
            jitter: self.jitter_level >> JITTER_ROUNDING_BITS,
            last_sr: self.last_sr_ntp.map(|ntp| ntp.middle_bits()).unwrap_or(0),
            delay_since_last_sr: self
                .last_sr_received
                .map(|at| (at.elapsed().as_secs_f64() * 65536.0) as u32)
                .unwrap_or(0),
        };

        self.lost_since_last_rr = 0;
        self.last_rr_sequence = self.expected_sequence;
        block
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tx_fold_resets_accumulators() {
        let mut tx = TxState::new(100);
        tx.packets_sent = 10;
        tx.octets_sent = 1600;
        tx.send_time_accum = 200;
        tx.min_send_time_accum = 18;
        tx.max_send_time_accum = 25;
        tx.stats_count = 10;

        tx.fold(10);
        assert_eq!(tx.stats.average_send_time, 20);
        assert_eq!(tx.stats.minimum_send_time, 18);
        assert_eq!(tx.stats.maximum_send_time, 25);
        assert_eq!(tx.stats_count, 0);
        assert_eq!(tx.send_time_accum, 0);
    }

    #[test]
    fn test_report_block_fraction() {
        let mut rx = RxState::new(false);
        rx.ssrc_in = 42;
        rx.expected_sequence = 100;
        rx.last_rr_sequence = 0;
        rx.packets_lost = 25;
        rx.lost_since_last_rr = 25;

        let block = rx.build_report_block();
        // 25 lost in 100 expected -> 64/256
        assert_eq!(block.fraction_lost, 64);
        assert_eq!(block.cumulative_lost, 25);
        assert_eq!(block.highest_sequence & 0xffff, 100);

        // Interval counters reset after the report
        assert_eq!(rx.lost_since_last_rr, 0);
        assert_eq!(rx.last_rr_sequence, 100);
    }

    #[test]
    fn test_report_block_no_advance() {
        let mut rx = RxState::new(false);
        rx.expected_sequence = 50;
        rx.last_rr_sequence = 50;
        let block = rx.build_report_block();
        assert_eq!(block.fraction_lost, 0);
    }

    #[test]
    fn test_jitter_snapshot_drops_rounding_bits() {
        let mut rx = RxState::new(false);
        rx.jitter_level = 160;
        rx.maximum_jitter_level = 320;
        let stats = rx.snapshot();
        assert_eq!(stats.jitter, 10);
        assert_eq!(stats.maximum_jitter, 20);
    }
}
