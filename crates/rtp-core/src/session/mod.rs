//! RTP session
//!
//! One session carries one media channel (an audio direction pair or a
//! video channel) over a UDP socket pair, data on the even port and RTCP
//! control on the odd. The send path stamps sequence numbers, SSRC and
//! timestamp offsets; the receive path enforces the version/payload
//! type/SSRC policies and keeps loss, reorder and jitter statistics; a
//! compound SR/RR + SDES report goes out on the control socket at the
//! report interval.

pub mod stats;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tracing::{debug, info, trace, warn};

use tandem_transport_core::nat::NatMethods;
use tandem_transport_core::ports::{AllocatedPort, PortRange};
use tandem_transport_core::transport::udp::UdpTransport;
use tandem_transport_core::transport::Transport;

use crate::error::{Error, Result};
use crate::packet::rtcp::{
    AppPacket, Goodbye, NtpTimestamp, ReceiverReport, RtcpCompound, RtcpPacket, SenderReport,
    SourceDescription,
};
use crate::packet::{RtpHeader, RtpPacket};
use crate::{
    Result as RtpResult, RtpPayloadType, RtpSequenceNumber, RtpSsrc, RtpTimestamp,
    MAX_PAYLOAD_TYPE,
};

use stats::{ReceiverStats, RxState, SenderStats, TxState, JITTER_ROUNDING_BITS};

/// Consecutive out-of-order packets before the receiver assumes the
/// sender renumbered and adopts the new sequence base
const SEQUENCE_RENUMBER_THRESHOLD: u32 = 10;

/// Default compound report interval
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(12);

/// Default number of sent/received packets between statistics callbacks
pub const DEFAULT_STATISTICS_INTERVAL: u32 = 100;

/// Verdict of the receive path for one packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverAction {
    /// Deliver the packet to the media stream
    Process,
    /// Drop the packet, session stays alive
    Ignore,
    /// Unrecoverable; tear the transport down
    AbortTransport,
}

/// Hook applied to packets before send and after receive (SRTP seam)
pub trait ProtectionHook: Send + Sync {
    /// Transform an outgoing serialized packet in place
    fn protect(&self, packet: &mut BytesMut) -> RtpResult<()>;

    /// Transform an incoming datagram in place before parsing
    fn unprotect(&self, packet: &mut BytesMut) -> RtpResult<()>;
}

/// Callbacks out of the session. All default to no-ops.
pub trait SessionObserver: Send + Sync {
    /// Send statistics snapshot, first packet and then every interval
    fn on_tx_statistics(&self, _stats: &SenderStats) {}

    /// Receive statistics snapshot, first packet and then every interval
    fn on_rx_statistics(&self, _stats: &ReceiverStats) {}

    /// Peer sent an SR
    fn on_sender_report(&self, _report: &SenderReport) {}

    /// Peer sent an RR
    fn on_receiver_report(&self, _report: &ReceiverReport) {}

    /// Peer described itself
    fn on_source_description(&self, _sdes: &SourceDescription) {}

    /// Peer said goodbye
    fn on_goodbye(&self, _bye: &Goodbye) {}

    /// Application-defined control packet
    fn on_app(&self, _app: &AppPacket) {}

    /// Video decoder refresh requested
    fn on_intra_frame_request(&self) {}
}

/// Events from the spawned receive loop
#[derive(Debug)]
pub enum RtpSessionEvent {
    /// A media packet passed the receive checks
    Packet(RtpPacket),
    /// The peer sent BYE
    Bye,
    /// The session closed
    Closed,
}

/// Session configuration
#[derive(Debug, Clone)]
pub struct RtpSessionConfig {
    /// Local IP to bind both sockets on
    pub local_address: IpAddr,

    /// Where to send media, when already known
    pub remote_data_address: Option<SocketAddr>,

    /// Where to send RTCP, when already known
    pub remote_control_address: Option<SocketAddr>,

    /// Outgoing SSRC; random when `None`
    pub ssrc: Option<RtpSsrc>,

    /// Media clock rate, Hz
    pub clock_rate: u32,

    /// Audio session: marker bits start talk spurts and are excluded
    /// from inter-packet timing statistics
    pub audio: bool,

    /// CNAME for SDES; `user@host` derived when `None`
    pub canonical_name: Option<String>,

    /// TOOL for SDES
    pub tool_name: String,

    /// Base compound report interval; the actual timer jitters +-1/3
    pub report_interval: Duration,

    /// Sent packets between tx statistics callbacks
    pub tx_statistics_interval: u32,

    /// Received packets between rx statistics callbacks
    pub rx_statistics_interval: u32,

    /// Relatch the inbound SSRC on any change
    pub allow_any_ssrc: bool,

    /// Permit exactly one inbound SSRC change, then lock.
    /// The flag stays armed until used; prefer `allow_any_ssrc: false`
    /// with this off when the peer is untrusted.
    pub allow_one_ssrc_change: bool,

    /// Accept payload type changes without dropping
    pub ignore_payload_type_changes: bool,

    /// Drop out-of-order packets instead of delivering them.
    /// Cleared when a jitter buffer sits in front of the read path.
    pub ignore_out_of_order_packets: bool,

    /// Tear the session down when the peer sends BYE
    pub close_on_bye: bool,

    /// Let the peer's transmit address float after the first packet
    pub allow_remote_address_change: bool,
}

impl Default for RtpSessionConfig {
    fn default() -> Self {
        Self {
            local_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            remote_data_address: None,
            remote_control_address: None,
            ssrc: None,
            clock_rate: 8000,
            audio: true,
            canonical_name: None,
            tool_name: "tandem".to_string(),
            report_interval: DEFAULT_REPORT_INTERVAL,
            tx_statistics_interval: DEFAULT_STATISTICS_INTERVAL,
            rx_statistics_interval: DEFAULT_STATISTICS_INTERVAL,
            allow_any_ssrc: true,
            allow_one_ssrc_change: false,
            ignore_payload_type_changes: true,
            ignore_out_of_order_packets: true,
            close_on_bye: false,
            allow_remote_address_change: false,
        }
    }
}

struct ReportState {
    next_due: Instant,
}

/// An RTP media session over a UDP socket pair
#[derive(Clone)]
pub struct RtpSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    config: RtpSessionConfig,
    data: UdpTransport,
    control: UdpTransport,
    // Held so the ports return to the range when the session drops
    _ports: Option<(AllocatedPort, AllocatedPort)>,
    ssrc_out: RtpSsrc,
    cname: String,
    advertised_data: SocketAddr,
    advertised_control: SocketAddr,
    remote_data: Mutex<Option<SocketAddr>>,
    remote_control: Mutex<Option<SocketAddr>>,
    tx: Mutex<TxState>,
    rx: Mutex<RxState>,
    report: Mutex<ReportState>,
    bye_sent: AtomicBool,
    closed: AtomicBool,
    observer: RwLock<Option<Arc<dyn SessionObserver>>>,
    protection: RwLock<Option<Arc<dyn ProtectionHook>>>,
}

impl RtpSession {
    /// Bind the socket pair and create the session.
    ///
    /// Ports come from `port_range` when given (even/odd RTP convention);
    /// otherwise the kernel assigns them. NAT methods, when applicable to
    /// the remote peer, determine the addresses advertised in signalling
    /// while the sockets stay bound to the private address.
    pub async fn bind(
        config: RtpSessionConfig,
        port_range: Option<&PortRange>,
        nat_methods: Option<&NatMethods>,
    ) -> Result<Self> {
        let (ports, data_port, control_port) = match port_range {
            Some(range) => {
                let (data, control) = range.allocate_pair()?;
                let ports = (data.port(), control.port());
                (Some((data, control)), ports.0, ports.1)
            }
            None => (None, 0, 0),
        };

        let data =
            UdpTransport::bind(SocketAddr::new(config.local_address, data_port)).await?;
        let control =
            UdpTransport::bind(SocketAddr::new(config.local_address, control_port)).await?;
        data.set_allow_remote_address_change(config.allow_remote_address_change);
        control.set_allow_remote_address_change(config.allow_remote_address_change);

        let local_data = data.local_address()?.socket_addr().unwrap();
        let local_control = control.local_address()?.socket_addr().unwrap();

        // Advertised addresses: wildcard binds report the route interface,
        // then NAT translation may substitute the public mapping
        let peer_ip = config.remote_data_address.map(|a| a.ip());
        let mut advertised_data = local_data;
        let mut advertised_control = local_control;
        if let Some(peer) = peer_ip {
            if advertised_data.ip().is_unspecified() {
                if let Some(interface) = tandem_transport_core::listener::route_interface_for(peer)
                {
                    advertised_data.set_ip(interface);
                    advertised_control.set_ip(interface);
                }
            }
            if let Some(nat) = nat_methods {
                advertised_data = nat.translate_address(advertised_data, peer).await;
                advertised_control = nat.translate_address(advertised_control, peer).await;
            }
        }

        let ssrc_out = config.ssrc.unwrap_or_else(|| rand::thread_rng().gen());
        let initial_sequence: RtpSequenceNumber = rand::thread_rng().gen();
        let cname = config.canonical_name.clone().unwrap_or_else(default_cname);

        info!(
            "RTP session bound data={} control={} ssrc={:08x}",
            local_data, local_control, ssrc_out
        );

        let inner = Arc::new(SessionInner {
            remote_data: Mutex::new(config.remote_data_address),
            remote_control: Mutex::new(
                config
                    .remote_control_address
                    .or_else(|| config.remote_data_address.map(control_address_for)),
            ),
            tx: Mutex::new(TxState::new(initial_sequence)),
            rx: Mutex::new(RxState::new(config.allow_one_ssrc_change)),
            report: Mutex::new(ReportState { next_due: Instant::now() + config.report_interval }),
            bye_sent: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            observer: RwLock::new(None),
            protection: RwLock::new(None),
            ssrc_out,
            cname,
            advertised_data,
            advertised_control,
            config,
            data,
            control,
            _ports: ports,
        });

        Ok(Self { inner })
    }

    /// Outgoing synchronization source
    pub fn ssrc(&self) -> RtpSsrc {
        self.inner.ssrc_out
    }

    /// Media clock rate this session was configured with
    pub fn clock_rate(&self) -> u32 {
        self.inner.config.clock_rate
    }

    /// Apply a DSCP marking to both sockets
    pub fn set_dscp(&self, dscp: u8) -> Result<()> {
        self.inner.data.set_dscp(dscp)?;
        self.inner.control.set_dscp(dscp)?;
        Ok(())
    }

    /// Inbound SSRC once latched, zero before
    pub fn remote_ssrc(&self) -> RtpSsrc {
        self.inner.rx.lock().ssrc_in
    }

    /// Address to advertise for media in signalling (NAT translated)
    pub fn advertised_data_address(&self) -> SocketAddr {
        self.inner.advertised_data
    }

    /// Address to advertise for RTCP in signalling (NAT translated)
    pub fn advertised_control_address(&self) -> SocketAddr {
        self.inner.advertised_control
    }

    /// Address the data socket is actually bound to
    pub fn local_data_address(&self) -> SocketAddr {
        self.inner.data.local_address().ok().and_then(|a| a.socket_addr()).unwrap()
    }

    /// Set where media and control go, e.g. after the SDP answer
    pub fn set_remote(&self, data: SocketAddr, control: Option<SocketAddr>) {
        *self.inner.remote_data.lock() = Some(data);
        *self.inner.remote_control.lock() = Some(control.unwrap_or_else(|| control_address_for(data)));
    }

    /// Register the observer for statistics and RTCP callbacks
    pub fn set_observer(&self, observer: Arc<dyn SessionObserver>) {
        *self.inner.observer.write() = Some(observer);
    }

    /// Install the SRTP protection hook
    pub fn set_protection(&self, hook: Arc<dyn ProtectionHook>) {
        *self.inner.protection.write() = Some(hook);
    }

    /// True until `close()` or a fatal receive error
    pub fn is_open(&self) -> bool {
        !self.inner.closed.load(Ordering::Relaxed)
    }

    /// Media clock units per millisecond
    fn units_per_ms(&self) -> u32 {
        (self.inner.config.clock_rate / 1000).max(1)
    }

    // ------------------------------------------------------------------
    // Send path
    // ------------------------------------------------------------------

    /// Build and send a media packet
    pub async fn send_data(
        &self,
        payload_type: RtpPayloadType,
        timestamp: RtpTimestamp,
        marker: bool,
        payload: Bytes,
    ) -> Result<()> {
        let mut header = RtpHeader::new(payload_type, 0, timestamp, 0);
        header.marker = marker;
        let mut packet = RtpPacket::new(header, payload);
        self.send_packet(&mut packet).await
    }

    /// Stamp and send a prepared packet.
    ///
    /// Sequence number and SSRC are always overwritten; the timestamp is
    /// shifted by the session offset established on the first packet.
    pub async fn send_packet(&self, packet: &mut RtpPacket) -> Result<()> {
        if !self.is_open() {
            return Err(Error::SessionClosed);
        }

        let stats_due = self.on_send_data(packet);
        if let Some(stats) = stats_due {
            if let Some(observer) = self.inner.observer.read().clone() {
                observer.on_tx_statistics(&stats);
            }
        }

        self.send_report_if_due().await?;

        let mut wire = BytesMut::from(&packet.serialize()?[..]);
        if let Some(hook) = self.inner.protection.read().clone() {
            hook.protect(&mut wire)?;
        }

        let dest = self
            .inner
            .remote_data
            .lock()
            .ok_or_else(|| Error::SessionError("no remote media address".to_string()))?;
        self.inner.data.send_to(&wire, dest).await?;
        Ok(())
    }

    /// Inject a frame outside the media stream pacing (RFC 2833 events,
    /// tones). With `rewrite_timestamp` the timestamp is phase locked to
    /// the wall clock via the out-of-band base.
    pub async fn write_oob_data(
        &self,
        packet: &mut RtpPacket,
        rewrite_timestamp: bool,
    ) -> Result<()> {
        let units_per_ms = self.units_per_ms();
        {
            let mut tx = self.inner.tx.lock();
            if !tx.oob_base_established {
                tx.oob_base_established = true;
                tx.oob_wall_base = Instant::now();
                tx.oob_timestamp_base = if rewrite_timestamp {
                    rand::thread_rng().gen()
                } else {
                    packet.header.timestamp
                };
            }
            if rewrite_timestamp {
                let elapsed = tx.oob_wall_base.elapsed().as_millis() as u32;
                packet.header.timestamp =
                    tx.oob_timestamp_base.wrapping_add(elapsed.wrapping_mul(units_per_ms));
            }
        }
        self.send_packet(packet).await
    }

    /// The send half of the state machine; returns a statistics snapshot
    /// when the callback is due.
    fn on_send_data(&self, packet: &mut RtpPacket) -> Option<SenderStats> {
        let config = &self.inner.config;
        let units_per_ms = self.units_per_ms();
        let now = Instant::now();
        let mut tx = self.inner.tx.lock();

        tx.last_sequence = tx.last_sequence.wrapping_add(1);
        packet.header.sequence_number = tx.last_sequence;
        packet.header.ssrc = self.inner.ssrc_out;

        if tx.packets_sent == 0 {
            if tx.oob_base_established {
                // Out-of-band frames went first; phase the media clock in
                // behind them
                let elapsed = tx.oob_wall_base.elapsed().as_millis() as u32;
                tx.timestamp_offset = tx
                    .oob_timestamp_base
                    .wrapping_sub(packet.header.timestamp)
                    .wrapping_add(elapsed.wrapping_mul(units_per_ms));
                packet.header.timestamp =
                    packet.header.timestamp.wrapping_add(tx.timestamp_offset);
            } else {
                tx.oob_base_established = true;
                tx.timestamp_offset = 0;
                tx.oob_timestamp_base = packet.header.timestamp;
                tx.oob_wall_base = now;
            }
            debug!(
                "First sent data: pt={} psz={} m={} seq={} ts={} ssrc={:08x}",
                packet.header.payload_type,
                packet.payload.len(),
                packet.header.marker,
                packet.header.sequence_number,
                packet.header.timestamp,
                packet.header.ssrc
            );
        } else {
            let ts = packet.header.timestamp.wrapping_add(tx.timestamp_offset);
            packet.header.timestamp = ts;

            // Marker restarts the out-of-band base for audio talk spurts
            if packet.header.marker {
                tx.oob_timestamp_base = ts;
                tx.oob_wall_base = now;
            }

            if !(config.audio && packet.header.marker) {
                if let Some(last) = tx.last_packet_time {
                    let diff = now.duration_since(last).as_millis() as u32;
                    tx.send_time_accum += diff as u64;
                    tx.max_send_time_accum = tx.max_send_time_accum.max(diff);
                    tx.min_send_time_accum = tx.min_send_time_accum.min(diff);
                    tx.stats_count += 1;
                }
            }
        }

        tx.last_packet_time = Some(now);
        tx.last_timestamp = packet.header.timestamp;
        tx.octets_sent += packet.payload.len() as u64;
        tx.packets_sent += 1;
        if packet.header.marker {
            tx.marker_count += 1;
        }

        if tx.packets_sent == 1 {
            return Some(tx.snapshot());
        }
        if tx.stats_count >= config.tx_statistics_interval {
            tx.fold(config.tx_statistics_interval);
            trace!(
                "Transmit statistics: packets={} octets={} avgTime={} maxTime={} minTime={}",
                tx.stats.packets_sent,
                tx.stats.octets_sent,
                tx.stats.average_send_time,
                tx.stats.maximum_send_time,
                tx.stats.minimum_send_time
            );
            return Some(tx.stats.clone());
        }
        None
    }

    // ------------------------------------------------------------------
    // Receive path
    // ------------------------------------------------------------------

    /// Read and deliver the next media packet.
    ///
    /// Packets failing the receive checks are consumed silently; the call
    /// only returns for deliverable packets or a terminated session.
    pub async fn read_data(&self) -> Result<RtpPacket> {
        loop {
            let datagram = match self.inner.data.read_pdu().await {
                Ok(datagram) => datagram,
                Err(tandem_transport_core::Error::Interrupted)
                | Err(tandem_transport_core::Error::TransportClosed) => {
                    return Err(Error::SessionClosed)
                }
                Err(e) => return Err(e.into()),
            };

            let mut raw = BytesMut::from(&datagram[..]);
            if let Some(hook) = self.inner.protection.read().clone() {
                if hook.unprotect(&mut raw).is_err() {
                    debug!("Discarding packet failing unprotect");
                    continue;
                }
            }

            let packet = match RtpPacket::parse(&raw) {
                Ok(packet) => packet,
                Err(e) => {
                    debug!("Discarding undecodable packet: {}", e);
                    continue;
                }
            };

            match self.ingest(&packet) {
                ReceiverAction::Process => {
                    self.send_report_if_due().await?;
                    return Ok(packet);
                }
                ReceiverAction::Ignore => continue,
                ReceiverAction::AbortTransport => {
                    self.shutdown_sockets().await;
                    return Err(Error::SessionClosed);
                }
            }
        }
    }

    /// The receive half of the state machine. Pure with respect to the
    /// sockets so it can be driven directly in tests and by jitter-buffer
    /// front ends.
    pub fn ingest(&self, packet: &RtpPacket) -> ReceiverAction {
        let config = &self.inner.config;
        let units_per_ms = self.units_per_ms() as i64;
        let now = Instant::now();

        if packet.header.payload_type > MAX_PAYLOAD_TYPE {
            return ReceiverAction::Ignore;
        }

        let mut rx = self.inner.rx.lock();

        // Latch or verify the payload type
        match rx.last_payload_type {
            None => rx.last_payload_type = Some(packet.header.payload_type),
            Some(expected) if expected != packet.header.payload_type => {
                if !config.ignore_payload_type_changes {
                    debug!(
                        "Received payload type {} expecting {}",
                        packet.header.payload_type, expected
                    );
                    return ReceiverAction::Ignore;
                }
                rx.last_payload_type = Some(packet.header.payload_type);
            }
            _ => {}
        }

        if rx.packets_received == 0 {
            rx.ssrc_in = packet.header.ssrc;
            rx.expected_sequence = packet.header.sequence_number.wrapping_add(1);
            debug!(
                "First receive data: pt={} psz={} m={} seq={} ts={} ssrc={:08x}",
                packet.header.payload_type,
                packet.payload.len(),
                packet.header.marker,
                packet.header.sequence_number,
                packet.header.timestamp,
                packet.header.ssrc
            );
        } else {
            // SSRC policy: relatch always, once, or never
            if packet.header.ssrc != rx.ssrc_in {
                if config.allow_any_ssrc {
                    rx.ssrc_in = packet.header.ssrc;
                } else if rx.allow_one_ssrc_change {
                    debug!(
                        "Allowed one SSRC change {:08x} -> {:08x}",
                        rx.ssrc_in, packet.header.ssrc
                    );
                    rx.ssrc_in = packet.header.ssrc;
                    rx.allow_one_ssrc_change = false;
                } else {
                    debug!(
                        "Packet from SSRC {:08x} ignored, expecting {:08x}",
                        packet.header.ssrc, rx.ssrc_in
                    );
                    return ReceiverAction::Ignore;
                }
            }

            let sequence = packet.header.sequence_number;
            if sequence == rx.expected_sequence {
                if rx.expected_sequence == 0 {
                    rx.sequence_cycles += 1;
                }
                rx.expected_sequence = rx.expected_sequence.wrapping_add(1);
                rx.consecutive_out_of_order = 0;

                // Skip timing on the packet restarting an audio talk spurt
                if !(config.audio && packet.header.marker) {
                    if let Some(last) = rx.last_packet_time {
                        let diff_ms = now.duration_since(last).as_millis() as u32;
                        rx.receive_time_accum += diff_ms as u64;
                        rx.max_receive_time_accum = rx.max_receive_time_accum.max(diff_ms);
                        rx.min_receive_time_accum = rx.min_receive_time_accum.min(diff_ms);
                        rx.stats_count += 1;

                        // RFC 3550 interarrival jitter on the scaled
                        // accumulator: J += |D| - ((J + 8) >> 4)
                        let transit = diff_ms as i64 * units_per_ms;
                        let variance = (transit - rx.last_transit).unsigned_abs() as u32;
                        rx.last_transit = transit;
                        let decay = (rx.jitter_level + (1 << (JITTER_ROUNDING_BITS - 1)))
                            >> JITTER_ROUNDING_BITS;
                        rx.jitter_level =
                            rx.jitter_level.saturating_add(variance).saturating_sub(decay);
                        if rx.jitter_level > rx.maximum_jitter_level {
                            rx.maximum_jitter_level = rx.jitter_level;
                        }
                    }
                }
            } else if sequence.wrapping_sub(rx.expected_sequence) > 0x8000 {
                // Sequence below expected: late or duplicated
                debug!(
                    "Out of order packet, received {} expected {} ssrc={:08x}",
                    sequence, rx.expected_sequence, rx.ssrc_in
                );
                rx.packets_out_of_order += 1;

                rx.consecutive_out_of_order += 1;
                if rx.consecutive_out_of_order > SEQUENCE_RENUMBER_THRESHOLD {
                    // Sender appears to have renumbered from a new base
                    rx.expected_sequence = sequence.wrapping_add(1);
                    rx.consecutive_out_of_order = 0;
                    warn!(
                        "Abnormal sequence change, adjusting to expect {} ssrc={:08x}",
                        rx.expected_sequence, rx.ssrc_in
                    );
                }

                if config.ignore_out_of_order_packets {
                    return ReceiverAction::Ignore;
                }
            } else {
                // Sequence above expected: the gap was lost
                let dropped = sequence.wrapping_sub(rx.expected_sequence) as u64;
                rx.packets_lost += dropped;
                rx.lost_since_last_rr += dropped;
                debug!(
                    "Dropped {} packet(s) at {}, ssrc={:08x}",
                    dropped, sequence, rx.ssrc_in
                );
                rx.expected_sequence = sequence.wrapping_add(1);
                rx.consecutive_out_of_order = 0;
            }

            if packet.header.marker {
                rx.marker_count += 1;
            }
        }

        rx.last_packet_time = Some(now);
        rx.octets_received += packet.payload.len() as u64;
        rx.packets_received += 1;

        let stats_due = if rx.packets_received == 1 {
            Some(rx.snapshot())
        } else if rx.stats_count >= config.rx_statistics_interval {
            rx.fold(config.rx_statistics_interval);
            trace!(
                "Receive statistics: packets={} octets={} lost={} order={} jitter={}",
                rx.stats.packets_received,
                rx.stats.octets_received,
                rx.stats.packets_lost,
                rx.stats.packets_out_of_order,
                rx.stats.jitter
            );
            Some(rx.stats.clone())
        } else {
            None
        };
        drop(rx);

        if let Some(stats) = stats_due {
            if let Some(observer) = self.inner.observer.read().clone() {
                observer.on_rx_statistics(&stats);
            }
        }

        ReceiverAction::Process
    }

    /// Record jitter-buffer discards in the receive statistics
    pub fn add_packets_too_late(&self, count: u64) {
        self.inner.rx.lock().packets_too_late += count;
    }

    // ------------------------------------------------------------------
    // RTCP
    // ------------------------------------------------------------------

    /// Send a compound report now if the report timer expired
    pub async fn send_report_if_due(&self) -> Result<()> {
        {
            let report = self.inner.report.lock();
            if Instant::now() < report.next_due {
                return Ok(());
            }
        }
        self.send_report().await
    }

    /// Build and send the compound report: SR when we have sent anything
    /// (with a reception report once receiving), RR otherwise, always
    /// followed by SDES with CNAME and TOOL.
    pub async fn send_report(&self) -> Result<()> {
        let (packets_sent, octets_sent, last_timestamp) = {
            let tx = self.inner.tx.lock();
            (tx.packets_sent, tx.octets_sent, tx.last_timestamp)
        };
        let (packets_received, report_block) = {
            let mut rx = self.inner.rx.lock();
            let block =
                if rx.packets_received > 0 { Some(rx.build_report_block()) } else { None };
            (rx.packets_received, block)
        };

        self.rearm_report_timer();

        // Nothing to report yet
        if packets_sent == 0 && packets_received == 0 {
            return Ok(());
        }

        let mut compound = RtcpCompound::new();
        if packets_sent > 0 {
            let mut sr = SenderReport::new(self.inner.ssrc_out);
            sr.ntp_timestamp = NtpTimestamp::now();
            sr.rtp_timestamp = last_timestamp;
            sr.packet_count = packets_sent.min(u32::MAX as u64) as u32;
            sr.octet_count = octets_sent.min(u32::MAX as u64) as u32;
            if let Some(block) = report_block {
                sr.reports.push(block);
            }
            trace!(
                "Sending SenderReport: ssrc={:08x} rtp={} psent={} osent={}",
                self.inner.ssrc_out,
                sr.rtp_timestamp,
                sr.packet_count,
                sr.octet_count
            );
            compound.push(RtcpPacket::SenderReport(sr));
        } else {
            let mut rr = ReceiverReport::new(self.inner.ssrc_out);
            if let Some(block) = report_block {
                rr.reports.push(block);
            }
            compound.push(RtcpPacket::ReceiverReport(rr));
        }

        compound.push(RtcpPacket::SourceDescription(SourceDescription::for_session(
            self.inner.ssrc_out,
            &self.inner.cname,
            &self.inner.config.tool_name,
        )));

        self.send_control(&compound).await
    }

    /// Write a compound packet on the control socket
    pub async fn send_control(&self, compound: &RtcpCompound) -> Result<()> {
        let dest = match *self.inner.remote_control.lock() {
            Some(dest) => dest,
            // Control destination unknown: silently skip, media can flow
            None => return Ok(()),
        };
        let wire = compound.serialize()?;
        self.inner.control.send_to(&wire, dest).await?;
        Ok(())
    }

    // Fuzzy re-arm so report timers do not lock step across sessions:
    // base interval +- one third
    fn rearm_report_timer(&self) {
        let base = self.inner.config.report_interval.as_millis() as u64;
        let third = base / 3;
        let jittered = if third > 0 {
            base - third + rand::thread_rng().gen_range(0..2 * third)
        } else {
            base
        };
        self.inner.report.lock().next_due = Instant::now() + Duration::from_millis(jittered);
    }

    /// Process one inbound control datagram
    pub fn process_control(&self, compound: &RtcpCompound) -> ReceiverAction {
        let observer = self.inner.observer.read().clone();
        let mut action = ReceiverAction::Process;

        for packet in &compound.packets {
            match packet {
                RtcpPacket::SenderReport(sr) => {
                    {
                        let mut rx = self.inner.rx.lock();
                        rx.last_sr_ntp = Some(sr.ntp_timestamp);
                        rx.last_sr_received = Some(Instant::now());
                    }
                    trace!(
                        "SenderReport: ssrc={:08x} psent={} osent={}",
                        sr.ssrc,
                        sr.packet_count,
                        sr.octet_count
                    );
                    if let Some(ref obs) = observer {
                        obs.on_sender_report(sr);
                    }
                }
                RtcpPacket::ReceiverReport(rr) => {
                    for block in &rr.reports {
                        trace!(
                            "ReceiverReport: ssrc={:08x} fraction={} lost={} jitter={}",
                            block.ssrc,
                            block.fraction_lost,
                            block.cumulative_lost,
                            block.jitter
                        );
                    }
                    if let Some(ref obs) = observer {
                        obs.on_receiver_report(rr);
                    }
                }
                RtcpPacket::SourceDescription(sdes) => {
                    if let Some(ref obs) = observer {
                        obs.on_source_description(sdes);
                    }
                }
                RtcpPacket::Goodbye(bye) => {
                    info!(
                        "Received BYE for {:?} reason={:?}",
                        bye.sources, bye.reason
                    );
                    if let Some(ref obs) = observer {
                        obs.on_goodbye(bye);
                    }
                    if self.inner.config.close_on_bye {
                        action = ReceiverAction::AbortTransport;
                    }
                }
                RtcpPacket::App(app) => {
                    debug!("APP packet \"{}\" subtype {}", app.name_str(), app.subtype);
                    if let Some(ref obs) = observer {
                        obs.on_app(app);
                    }
                }
                RtcpPacket::IntraFrameRequest { .. } => {
                    if let Some(ref obs) = observer {
                        obs.on_intra_frame_request();
                    }
                }
            }
        }
        action
    }

    /// Spawn the control socket reader. Returns an event channel that
    /// reports BYE and close so owners can react.
    pub fn start_control_loop(&self) -> tokio::sync::mpsc::Receiver<RtpSessionEvent> {
        let (tx, rx) = tokio::sync::mpsc::channel(16);
        let session = self.clone();
        tokio::spawn(async move {
            loop {
                let datagram = match session.inner.control.read_pdu().await {
                    Ok(datagram) => datagram,
                    Err(_) => break,
                };
                match RtcpCompound::parse(&datagram) {
                    Ok(compound) => {
                        let had_bye = compound
                            .packets
                            .iter()
                            .any(|p| matches!(p, RtcpPacket::Goodbye(_)));
                        let action = session.process_control(&compound);
                        if had_bye {
                            let _ = tx.send(RtpSessionEvent::Bye).await;
                        }
                        if action == ReceiverAction::AbortTransport {
                            session.shutdown_sockets().await;
                            break;
                        }
                    }
                    Err(e) => {
                        // Truncated RTCP is logged and dropped, not fatal
                        debug!("Ignoring malformed control packet: {}", e);
                    }
                }
            }
            let _ = tx.send(RtpSessionEvent::Closed).await;
        });
        rx
    }

    /// Send BYE on the control socket; only the first call emits
    pub async fn send_bye(&self, reason: Option<&str>) -> Result<()> {
        if self.inner.bye_sent.swap(true, Ordering::Relaxed) {
            return Ok(());
        }
        let bye = match reason {
            Some(reason) => Goodbye::with_reason(self.inner.ssrc_out, reason),
            None => Goodbye::for_source(self.inner.ssrc_out),
        };
        let mut compound = RtcpCompound::new();
        compound.push(RtcpPacket::Goodbye(bye));
        self.send_control(&compound).await
    }

    /// Send BYE and shut the sockets down. Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.load(Ordering::Relaxed) {
            return;
        }
        let _ = self.send_bye(None).await;
        self.shutdown_sockets().await;
    }

    async fn shutdown_sockets(&self) {
        if self.inner.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        self.inner.data.close().await;
        self.inner.control.close().await;
        info!("RTP session {:08x} closed", self.inner.ssrc_out);
    }

    /// Transmit statistics snapshot
    pub fn sender_stats(&self) -> SenderStats {
        self.inner.tx.lock().snapshot()
    }

    /// Receive statistics snapshot
    pub fn receiver_stats(&self) -> ReceiverStats {
        self.inner.rx.lock().snapshot()
    }

    /// Time since the last media packet arrived; `None` before the first
    pub fn time_since_last_received(&self) -> Option<Duration> {
        self.inner.rx.lock().last_packet_time.map(|at| at.elapsed())
    }

    /// Sequence number the receiver expects next
    pub fn expected_sequence(&self) -> RtpSequenceNumber {
        self.inner.rx.lock().expected_sequence
    }

    /// Sequence number of the last sent packet
    pub fn last_sent_sequence(&self) -> RtpSequenceNumber {
        self.inner.tx.lock().last_sequence
    }
}

impl std::fmt::Debug for RtpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RtpSession(ssrc={:08x})", self.inner.ssrc_out)
    }
}

/// RTCP goes on the data port plus one
fn control_address_for(data: SocketAddr) -> SocketAddr {
    SocketAddr::new(data.ip(), data.port().wrapping_add(1))
}

fn default_cname() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    format!("{}@{}", whoami(), host)
}

fn whoami() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "tandem".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn unbound_session(config: RtpSessionConfig) -> RtpSession {
        let mut config = config;
        config.local_address = "127.0.0.1".parse().unwrap();
        RtpSession::bind(config, None, None).await.unwrap()
    }

    fn packet(seq: RtpSequenceNumber, ssrc: RtpSsrc, pt: RtpPayloadType) -> RtpPacket {
        RtpPacket::new(RtpHeader::new(pt, seq, seq as u32 * 160, ssrc), Bytes::from_static(b"0123456789"))
    }

    #[tokio::test]
    async fn test_send_sequence_increments_by_one() {
        let session = unbound_session(RtpSessionConfig {
            remote_data_address: Some("127.0.0.1:9".parse().unwrap()),
            ..Default::default()
        })
        .await;

        let first = {
            let mut p = packet(0, 0, 0);
            session.send_packet(&mut p).await.unwrap();
            p.header.sequence_number
        };
        for i in 1..=5u16 {
            let mut p = packet(0, 0, 0);
            session.send_packet(&mut p).await.unwrap();
            assert_eq!(p.header.sequence_number, first.wrapping_add(i));
            assert_eq!(p.header.ssrc, session.ssrc());
        }
    }

    #[tokio::test]
    async fn test_receive_in_order_no_loss() {
        let session = unbound_session(Default::default()).await;
        for seq in 100..110u16 {
            assert_eq!(session.ingest(&packet(seq, 7, 0)), ReceiverAction::Process);
        }
        let stats = session.receiver_stats();
        assert_eq!(stats.packets_received, 10);
        assert_eq!(stats.packets_lost, 0);
        assert_eq!(session.expected_sequence(), 110);
    }

    #[tokio::test]
    async fn test_receive_gap_counts_lost() {
        let session = unbound_session(Default::default()).await;
        session.ingest(&packet(100, 7, 0));
        session.ingest(&packet(101, 7, 0));
        // 102..=104 lost
        session.ingest(&packet(105, 7, 0));
        let stats = session.receiver_stats();
        assert_eq!(stats.packets_lost, 3);
        assert_eq!(session.expected_sequence(), 106);
    }

    #[tokio::test]
    async fn test_out_of_order_dropped_and_counted() {
        let session = unbound_session(Default::default()).await;
        session.ingest(&packet(100, 7, 0));
        session.ingest(&packet(101, 7, 0));
        assert_eq!(session.ingest(&packet(50, 7, 0)), ReceiverAction::Ignore);
        let stats = session.receiver_stats();
        assert_eq!(stats.packets_out_of_order, 1);
    }

    #[tokio::test]
    async fn test_sequence_renumber_adoption() {
        let session = unbound_session(Default::default()).await;
        session.ingest(&packet(60000, 7, 0));
        // Sender restarts from a much lower base; after more than 10
        // consecutive early packets the receiver adopts the new numbering
        let mut adopted = false;
        for seq in 100..115u16 {
            session.ingest(&packet(seq, 7, 0));
            if session.expected_sequence() == seq.wrapping_add(1) {
                adopted = true;
                break;
            }
        }
        assert!(adopted, "receiver never adopted the renumbered base");
    }

    #[tokio::test]
    async fn test_ssrc_locked_when_any_disallowed() {
        let session = unbound_session(RtpSessionConfig {
            allow_any_ssrc: false,
            ..Default::default()
        })
        .await;
        session.ingest(&packet(10, 7, 0));
        assert_eq!(session.ingest(&packet(11, 8, 0)), ReceiverAction::Ignore);
        assert_eq!(session.remote_ssrc(), 7);
    }

    #[tokio::test]
    async fn test_one_ssrc_change_consumed() {
        let session = unbound_session(RtpSessionConfig {
            allow_any_ssrc: false,
            allow_one_ssrc_change: true,
            ..Default::default()
        })
        .await;
        session.ingest(&packet(10, 7, 0));
        // First change allowed and consumes the flag
        assert_eq!(session.ingest(&packet(11, 8, 0)), ReceiverAction::Process);
        assert_eq!(session.remote_ssrc(), 8);
        // Second change refused
        assert_eq!(session.ingest(&packet(12, 9, 0)), ReceiverAction::Ignore);
        assert_eq!(session.remote_ssrc(), 8);
    }

    #[tokio::test]
    async fn test_payload_type_mismatch_dropped() {
        let session = unbound_session(RtpSessionConfig {
            ignore_payload_type_changes: false,
            ..Default::default()
        })
        .await;
        session.ingest(&packet(10, 7, 0));
        assert_eq!(session.ingest(&packet(11, 7, 8)), ReceiverAction::Ignore);
    }

    #[tokio::test]
    async fn test_report_contains_sr_and_sdes() {
        let a = unbound_session(RtpSessionConfig {
            canonical_name: Some("alice@test".to_string()),
            tool_name: "tandem-test".to_string(),
            ..Default::default()
        })
        .await;
        let b = unbound_session(Default::default()).await;
        a.set_remote(
            b.local_data_address(),
            Some(b.inner.control.local_address().unwrap().socket_addr().unwrap()),
        );

        let mut p = packet(0, 0, 0);
        a.send_packet(&mut p).await.unwrap();
        a.send_report().await.unwrap();

        let datagram = b.inner.control.read_pdu().await.unwrap();
        let compound = RtcpCompound::parse(&datagram).unwrap();
        assert_eq!(compound.packets.len(), 2);
        match &compound.packets[0] {
            RtcpPacket::SenderReport(sr) => {
                assert_eq!(sr.ssrc, a.ssrc());
                assert_eq!(sr.packet_count, 1);
            }
            other => panic!("expected SR, got {:?}", other),
        }
        match &compound.packets[1] {
            RtcpPacket::SourceDescription(sdes) => {
                assert_eq!(
                    sdes.chunks[0].find(crate::packet::rtcp::SdesItemKind::Cname),
                    Some("alice@test")
                );
                assert_eq!(
                    sdes.chunks[0].find(crate::packet::rtcp::SdesItemKind::Tool),
                    Some("tandem-test")
                );
            }
            other => panic!("expected SDES, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_receive_only_sends_rr() {
        let a = unbound_session(Default::default()).await;
        let b = unbound_session(Default::default()).await;
        a.set_remote(
            b.local_data_address(),
            Some(b.inner.control.local_address().unwrap().socket_addr().unwrap()),
        );

        // a has received but never sent
        a.ingest(&packet(5, 77, 0));
        a.send_report().await.unwrap();

        let datagram = b.inner.control.read_pdu().await.unwrap();
        let compound = RtcpCompound::parse(&datagram).unwrap();
        assert!(matches!(compound.packets[0], RtcpPacket::ReceiverReport(_)));
    }

    #[tokio::test]
    async fn test_bye_aborts_when_close_on_bye() {
        let session = unbound_session(RtpSessionConfig {
            close_on_bye: true,
            ..Default::default()
        })
        .await;
        let mut compound = RtcpCompound::new();
        compound.push(RtcpPacket::Goodbye(Goodbye::for_source(1)));
        assert_eq!(session.process_control(&compound), ReceiverAction::AbortTransport);
    }

    #[tokio::test]
    async fn test_bye_tolerated_by_default() {
        let session = unbound_session(Default::default()).await;
        let mut compound = RtcpCompound::new();
        compound.push(RtcpPacket::Goodbye(Goodbye::for_source(1)));
        assert_eq!(session.process_control(&compound), ReceiverAction::Process);
    }

    #[tokio::test]
    async fn test_oob_write_rewrites_timestamp() {
        let session = unbound_session(RtpSessionConfig {
            remote_data_address: Some("127.0.0.1:9".parse().unwrap()),
            ..Default::default()
        })
        .await;

        let mut first = packet(0, 0, 101);
        first.header.timestamp = 0;
        session.write_oob_data(&mut first, true).await.unwrap();
        let base = first.header.timestamp;

        tokio::time::sleep(Duration::from_millis(30)).await;
        let mut second = packet(0, 0, 101);
        second.header.timestamp = 0;
        session.write_oob_data(&mut second, true).await.unwrap();

        // ~30ms at 8kHz is ~240 units; allow generous scheduling slack
        let advance = second.header.timestamp.wrapping_sub(base);
        assert!(advance >= 160, "timestamp advanced only {}", advance);
    }

    #[tokio::test]
    async fn test_send_bye_only_once() {
        let a = unbound_session(Default::default()).await;
        let b = unbound_session(Default::default()).await;
        a.set_remote(
            b.local_data_address(),
            Some(b.inner.control.local_address().unwrap().socket_addr().unwrap()),
        );

        a.send_bye(Some("done")).await.unwrap();
        a.send_bye(Some("again")).await.unwrap();

        let datagram = b.inner.control.read_pdu().await.unwrap();
        let compound = RtcpCompound::parse(&datagram).unwrap();
        assert!(matches!(compound.packets[0], RtcpPacket::Goodbye(_)));

        // Only one BYE should be on the wire
        let second =
            tokio::time::timeout(Duration::from_millis(100), b.inner.control.read_pdu()).await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn test_nat_translated_advertised_address() {
        use async_trait::async_trait;
        use std::net::IpAddr;
        use tandem_transport_core::nat::NatMethod;

        struct TestNat;

        #[async_trait]
        impl NatMethod for TestNat {
            fn name(&self) -> &str {
                "Test"
            }
            fn is_applicable(&self, _: IpAddr, _: IpAddr) -> bool {
                true
            }
            async fn translate(&self, local: SocketAddr) -> Option<SocketAddr> {
                Some(SocketAddr::new("203.0.113.9".parse().unwrap(), local.port()))
            }
        }

        let mut methods = NatMethods::new();
        methods.add(Arc::new(TestNat));

        let config = RtpSessionConfig {
            local_address: "127.0.0.1".parse().unwrap(),
            remote_data_address: Some("127.0.0.2:5004".parse().unwrap()),
            ..Default::default()
        };
        let session = RtpSession::bind(config, None, Some(&methods)).await.unwrap();

        // Signalling advertises the mapped public address while the
        // socket stays bound privately
        let advertised = session.advertised_data_address();
        assert_eq!(advertised.ip().to_string(), "203.0.113.9");
        assert_eq!(advertised.port(), session.local_data_address().port());
        assert_eq!(session.local_data_address().ip().to_string(), "127.0.0.1");
    }

    #[tokio::test]
    async fn test_port_range_exhaustion_fails_cleanly() {
        let range = PortRange::new(46750, 46753);
        let config = RtpSessionConfig {
            local_address: "127.0.0.1".parse().unwrap(),
            ..Default::default()
        };

        // Two sessions consume both even/odd pairs
        let a = RtpSession::bind(config.clone(), Some(&range), None).await.unwrap();
        let b = RtpSession::bind(config.clone(), Some(&range), None).await.unwrap();

        // Third must fail with a clean error, not a panic
        assert!(RtpSession::bind(config.clone(), Some(&range), None).await.is_err());

        // Dropping a session returns its ports to the range
        drop(a);
        drop(b);
        let again = RtpSession::bind(config, Some(&range), None).await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn test_end_to_end_media_flow() {
        let a = unbound_session(Default::default()).await;
        let b = unbound_session(Default::default()).await;
        a.set_remote(b.local_data_address(), None);

        let sender = a.clone();
        tokio::spawn(async move {
            for i in 0..10u32 {
                sender
                    .send_data(0, i * 160, i == 0, Bytes::from_static(&[0u8; 160]))
                    .await
                    .unwrap();
            }
        });

        for _ in 0..10 {
            let packet = b.read_data().await.unwrap();
            assert_eq!(packet.header.ssrc, a.ssrc());
            assert_eq!(packet.payload.len(), 160);
        }
        let stats = b.receiver_stats();
        assert_eq!(stats.packets_received, 10);
        assert_eq!(stats.packets_lost, 0);
    }
}
