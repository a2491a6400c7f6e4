//! Connection
//!
//! One endpoint's view of its half of a call: the phase machine, party
//! identities, per-call string options, bandwidth accounting, the media
//! stream list and the RTP sessions behind it, and the user input
//! machinery. Failures set an end reason (first setter wins) and always
//! drive the connection through `Releasing` to `Released`, never around
//! it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::RwLock as AsyncRwLock;
use tracing::{debug, info, warn};

use tandem_media_core::dtmf::Rfc2833Event;
use tandem_media_core::filters::{DtmfInjector, SilenceDetectMode};
use tandem_media_core::format::{MediaFormat, MediaType};
use tandem_media_core::stream::MediaStream;
use tandem_media_core::{MediaPatch, OrderedFormatList};
use tandem_rtp_core::packet::{RtpHeader, RtpPacket};
use tandem_rtp_core::session::RtpSession;
use tandem_rtp_core::RtpSsrc;

use crate::call::Call;
use crate::endpoint::Endpoint;
use crate::error::{CallEndReason, Error, Result};
use crate::options::{
    parse_auto_start, parse_silence_mode, AutoStartMap, StringOptions, UserInputMode,
    OPT_AUTO_START, OPT_CALLED_DISPLAY_NAME, OPT_CALLED_PARTY_NAME, OPT_CALLING_DISPLAY_NAME,
    OPT_CALLING_PARTY_NAME, OPT_DISABLE_JITTER, OPT_DTMF_DIV, OPT_DTMF_MULT, OPT_MAX_JITTER,
    OPT_MIN_JITTER, OPT_REMOVE_CODEC, OPT_SILENCE_DETECT_MODE, OPT_USER_INPUT_MODE,
};
use crate::phase::{Phase, PhaseState};

/// Dynamic payload type conventionally used for RFC 2833 events
pub const RFC2833_PAYLOAD_TYPE: u8 = 101;

/// RTP session id conventionally used per media type
pub fn session_id_for(media_type: MediaType) -> u32 {
    match media_type {
        MediaType::Audio => 1,
        MediaType::Video => 2,
        MediaType::Data => 3,
    }
}

/// Identity of one party on a call
#[derive(Debug, Clone, Default)]
pub struct PartyInfo {
    /// Party name (user part or configured name)
    pub name: String,
    /// Dialled or calling number when numeric
    pub number: String,
    /// Human readable display name
    pub display_name: String,
    /// Full URL form, `scheme:user@host`
    pub url: String,
    /// Vendor/product of the party's equipment when known
    pub product: String,
}

impl PartyInfo {
    fn from_party(party: &str) -> Self {
        let url = party.to_string();
        let after_scheme = crate::routing::split_scheme(party)
            .map(|(_, rest)| rest)
            .unwrap_or(party);
        let name = after_scheme.split('@').next().unwrap_or("").to_string();
        let number = if name.chars().all(|c| c.is_ascii_digit()) && !name.is_empty() {
            name.clone()
        } else {
            String::new()
        };
        Self { name: name.clone(), number, display_name: name, url, product: String::new() }
    }
}

/// Jitter buffer parameters carried per connection
#[derive(Debug, Clone, Copy)]
pub struct JitterSettings {
    /// Minimum delay, milliseconds
    pub min_ms: u32,
    /// Maximum delay, milliseconds
    pub max_ms: u32,
    /// Completely disable buffering
    pub disabled: bool,
}

impl Default for JitterSettings {
    fn default() -> Self {
        Self { min_ms: 50, max_ms: 250, disabled: false }
    }
}

impl JitterSettings {
    /// Buffer config at a clock rate; `None` when buffering is off
    pub fn to_config(self, clock_rate: u32) -> Option<tandem_rtp_core::JitterBufferConfig> {
        if self.disabled || (self.min_ms == 0 && self.max_ms == 0) {
            return None;
        }
        Some(tandem_rtp_core::JitterBufferConfig::from_millis(
            self.min_ms,
            self.max_ms,
            clock_rate,
        ))
    }
}

/// Digits or a command from the far user
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserInput {
    /// A single tone with its duration in milliseconds
    Tone {
        /// The digit
        digit: char,
        /// Press duration, milliseconds
        duration_ms: u32,
    },
    /// A whole string sent through signalling
    Text(String),
}

struct BandwidthState {
    rx_budget: u64,
    tx_budget: u64,
    rx_used: u64,
    tx_used: u64,
}

struct StreamEntry {
    stream: Arc<dyn MediaStream>,
    reserved: u64,
    is_source: bool,
}

/// One half of a conversation
pub struct Connection {
    token: String,
    call: Weak<Call>,
    endpoint: Arc<dyn Endpoint>,
    originating: bool,

    phase: Mutex<PhaseState>,
    end_reason: Mutex<Option<CallEndReason>>,

    local_party: RwLock<PartyInfo>,
    remote_party: RwLock<PartyInfo>,
    called_party: RwLock<Option<String>>,

    string_options: RwLock<StringOptions>,
    auto_start: RwLock<AutoStartMap>,
    user_input_mode: RwLock<UserInputMode>,
    silence_mode: RwLock<SilenceDetectMode>,
    jitter: RwLock<JitterSettings>,
    dtmf_duration_mult: RwLock<u32>,
    dtmf_duration_div: RwLock<u32>,

    bandwidth: Mutex<BandwidthState>,
    streams: AsyncRwLock<Vec<StreamEntry>>,
    patches: AsyncRwLock<Vec<MediaPatch>>,
    rtp_sessions: AsyncRwLock<HashMap<u32, RtpSession>>,
    ssrc_to_session: Mutex<HashMap<RtpSsrc, u32>>,
    dtmf_injector: Mutex<Option<Arc<DtmfInjector>>>,

    hold_local: AtomicBool,
    hold_remote: AtomicBool,
}

impl Connection {
    /// Create a connection inside a call. Endpoints call this from their
    /// `make_connection` and then register the result.
    pub fn new(
        call: &Arc<Call>,
        endpoint: Arc<dyn Endpoint>,
        token: String,
        remote_party: &str,
        originating: bool,
        options: &StringOptions,
    ) -> Arc<Self> {
        let manager = call.manager();
        let mut local = PartyInfo::default();
        local.name = endpoint.core().default_user_name.read().clone();
        local.display_name = endpoint.core().default_display_name.read().clone();

        let connection = Arc::new(Self {
            token,
            call: Arc::downgrade(call),
            endpoint,
            originating,
            phase: Mutex::new(PhaseState::new()),
            end_reason: Mutex::new(None),
            local_party: RwLock::new(local),
            remote_party: RwLock::new(PartyInfo::from_party(remote_party)),
            called_party: RwLock::new(None),
            string_options: RwLock::new(options.clone()),
            auto_start: RwLock::new(default_auto_start()),
            user_input_mode: RwLock::new(UserInputMode::default()),
            silence_mode: RwLock::new(SilenceDetectMode::None),
            jitter: RwLock::new(manager.default_jitter()),
            dtmf_duration_mult: RwLock::new(1),
            dtmf_duration_div: RwLock::new(1),
            bandwidth: Mutex::new(BandwidthState {
                rx_budget: manager.default_bandwidth(),
                tx_budget: manager.default_bandwidth(),
                rx_used: 0,
                tx_used: 0,
            }),
            streams: AsyncRwLock::new(Vec::new()),
            patches: AsyncRwLock::new(Vec::new()),
            rtp_sessions: AsyncRwLock::new(HashMap::new()),
            ssrc_to_session: Mutex::new(HashMap::new()),
            dtmf_injector: Mutex::new(None),
            hold_local: AtomicBool::new(false),
            hold_remote: AtomicBool::new(false),
        });
        debug!(
            "Created connection {} to \"{}\" ({})",
            connection.token,
            remote_party,
            if originating { "originating" } else { "terminating" }
        );
        connection
    }

    /// Process-unique token
    pub fn token(&self) -> &str {
        &self.token
    }

    /// The call this connection belongs to, while it still exists
    pub fn call(&self) -> Option<Arc<Call>> {
        self.call.upgrade()
    }

    /// The endpoint that created this connection
    pub fn endpoint(&self) -> &Arc<dyn Endpoint> {
        &self.endpoint
    }

    /// True for the A-party (the side that initiated the call)
    pub fn is_originating(&self) -> bool {
        self.originating
    }

    /// True when the endpoint family terminates on the network
    pub fn is_network_connection(&self) -> bool {
        self.endpoint.is_network_endpoint()
    }

    // ------------------------------------------------------------------
    // Phase machine
    // ------------------------------------------------------------------

    /// Current phase
    pub fn phase(&self) -> Phase {
        self.phase.lock().phase()
    }

    /// When a phase was first entered
    pub fn phase_time(&self, phase: Phase) -> Option<std::time::Instant> {
        self.phase.lock().time_of(phase)
    }

    /// Advance the phase; backward requests are ignored
    pub fn set_phase(&self, next: Phase) -> bool {
        let mut phase = self.phase.lock();
        let from = phase.phase();
        let changed = phase.advance(next);
        drop(phase);
        if changed {
            debug!("Connection {} phase {} -> {}", self.token, from, next);
        }
        changed
    }

    /// Releasing or Released
    pub fn is_releasing(&self) -> bool {
        self.phase() >= Phase::Releasing
    }

    /// Fully released
    pub fn is_released(&self) -> bool {
        self.phase() == Phase::Released
    }

    /// The reason this connection ended, once set
    pub fn end_reason(&self) -> Option<CallEndReason> {
        *self.end_reason.lock()
    }

    /// Record the end reason; only the first setter wins
    pub fn set_end_reason(&self, reason: CallEndReason) {
        let mut slot = self.end_reason.lock();
        if slot.is_none() {
            info!("Connection {} end reason: {}", self.token, reason);
            *slot = Some(reason);
            if let Some(call) = self.call() {
                call.set_end_reason(reason);
            }
        }
    }

    // ------------------------------------------------------------------
    // Parties
    // ------------------------------------------------------------------

    /// Local party identity
    pub fn local_party(&self) -> PartyInfo {
        self.local_party.read().clone()
    }

    /// Remote party identity
    pub fn remote_party(&self) -> PartyInfo {
        self.remote_party.read().clone()
    }

    /// Full URL of the remote party
    pub fn remote_party_url(&self) -> String {
        self.remote_party.read().url.clone()
    }

    /// The address this connection was asked to reach (B party for
    /// inbound calls); consulted by the routing engine
    pub fn destination_address(&self) -> Option<String> {
        self.called_party.read().clone()
    }

    /// Record the destination carried by inbound signalling
    pub fn set_destination_address(&self, destination: &str) {
        *self.called_party.write() = Some(destination.to_string());
    }

    // ------------------------------------------------------------------
    // String options
    // ------------------------------------------------------------------

    /// This call's option map
    pub fn string_options(&self) -> StringOptions {
        self.string_options.read().clone()
    }

    /// Merge more options in; the new values win
    pub fn merge_string_options(&self, options: &StringOptions) {
        self.string_options.write().merge(options);
    }

    /// Fold the option map into typed state. Idempotent: applying the
    /// same map twice leaves the same observable state.
    pub fn apply_string_options(&self) {
        let options = self.string_options.read().clone();

        if let Some(mode) = options.get(OPT_USER_INPUT_MODE).and_then(UserInputMode::parse) {
            *self.user_input_mode.write() = mode;
        }
        if let Some(mode) = options.get(OPT_SILENCE_DETECT_MODE).and_then(parse_silence_mode) {
            *self.silence_mode.write() = mode;
        }

        {
            let mut jitter = self.jitter.write();
            if let Some(min) = options.get_u32(OPT_MIN_JITTER) {
                jitter.min_ms = min;
            }
            if let Some(max) = options.get_u32(OPT_MAX_JITTER) {
                jitter.max_ms = max.max(jitter.min_ms);
            }
            if options.get_bool(OPT_DISABLE_JITTER) {
                jitter.disabled = true;
            }
        }

        if let Some(auto_start) = options.get(OPT_AUTO_START) {
            *self.auto_start.write() = parse_auto_start(auto_start);
        }

        if let Some(mult) = options.get_u32(OPT_DTMF_MULT) {
            *self.dtmf_duration_mult.write() = mult.max(1);
        }
        if let Some(div) = options.get_u32(OPT_DTMF_DIV) {
            *self.dtmf_duration_div.write() = div.max(1);
        }

        {
            let mut local = self.local_party.write();
            if let Some(name) = options.get(if self.originating {
                OPT_CALLING_PARTY_NAME
            } else {
                OPT_CALLED_PARTY_NAME
            }) {
                local.name = name.to_string();
            }
            if let Some(display) = options.get(if self.originating {
                OPT_CALLING_DISPLAY_NAME
            } else {
                OPT_CALLED_DISPLAY_NAME
            }) {
                local.display_name = display.to_string();
            }
        }

        debug!("Connection {} applied {} string options", self.token, options.len());
    }

    /// Parsed auto-start directions
    pub fn auto_start_map(&self) -> AutoStartMap {
        self.auto_start.read().clone()
    }

    /// Active user input mode
    pub fn user_input_mode(&self) -> UserInputMode {
        *self.user_input_mode.read()
    }

    /// Silence detection mode for outgoing audio
    pub fn silence_mode(&self) -> SilenceDetectMode {
        *self.silence_mode.read()
    }

    /// Jitter parameters for this call
    pub fn jitter_settings(&self) -> JitterSettings {
        *self.jitter.read()
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Begin set-up. The A party runs the routing engine to find and
    /// build the B party; both then hand over to their endpoint's
    /// protocol behaviour.
    pub async fn set_up(self: &Arc<Self>) -> Result<()> {
        self.apply_string_options();
        self.set_phase(Phase::SetUp);

        if self.originating {
            let call = self.call().ok_or(Error::ConnectionReleased)?;
            let manager = call.manager();
            manager.on_incoming_connection(self).await?;
        }

        self.endpoint.clone().on_set_up_connection(self).await
    }

    /// Destination is handling the call
    pub fn on_proceeding(self: &Arc<Self>) {
        if self.set_phase(Phase::Proceeding) {
            if let Some(call) = self.call() {
                call.on_proceeding(self);
            }
        }
    }

    /// Destination user is being alerted; with `with_media` the sink side
    /// may open early media
    pub async fn on_alerting(self: &Arc<Self>, with_media: bool) {
        if self.set_phase(Phase::Alerting) {
            if let Some(call) = self.call() {
                call.on_alerting(self, with_media).await;
            }
        }
    }

    /// Destination answered. Idempotent: only the first call advances the
    /// phase and triggers establishment.
    pub async fn on_connected(self: &Arc<Self>) {
        if !self.set_phase(Phase::Connected) {
            return;
        }
        let Some(call) = self.call() else { return };
        call.on_connected(self).await;
        self.check_established().await;
    }

    /// Enter `Established` once connected with every stream open
    pub async fn check_established(self: &Arc<Self>) {
        if self.phase() != Phase::Connected {
            return;
        }
        let streams = self.streams.read().await;
        if streams.is_empty() || !streams.iter().all(|entry| entry.stream.is_open()) {
            return;
        }
        drop(streams);

        if self.set_phase(Phase::Established) {
            if let Some(call) = self.call() {
                call.on_established(self).await;
            }
        }
    }

    /// Release the connection.
    ///
    /// Sets the end reason (first setter wins) and advances to
    /// `Releasing`; the clean-up runs on the calling task when
    /// `synchronous`, otherwise on a decoupled worker. Idempotent.
    pub async fn release(self: &Arc<Self>, reason: CallEndReason, synchronous: bool) {
        self.set_end_reason(reason);
        if !self.set_phase(Phase::Releasing) {
            return; // Already on the way out
        }

        if synchronous {
            self.clone().finish_release().await;
        } else {
            let connection = self.clone();
            tokio::spawn(async move {
                connection.finish_release().await;
            });
        }
    }

    fn finish_release(
        self: Arc<Self>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        Box::pin(async move {
            debug!("Connection {} releasing", self.token);
            self.close_media_streams().await;

            self.set_phase(Phase::Released);

            if let Some(call) = self.call() {
                call.on_connection_released(&self).await;
                call.manager().notify_connection_released(&self);
            }
            self.endpoint.on_connection_released(&self).await;
            info!("Connection {} released", self.token);
        })
    }

    // ------------------------------------------------------------------
    // Media
    // ------------------------------------------------------------------

    /// Formats this connection can use right now: the endpoint's set
    /// reduced by per-call removals, per-codec option overrides and the
    /// manager's global order and mask.
    pub fn media_formats(&self) -> OrderedFormatList {
        let mut list = self.endpoint.media_formats();
        let options = self.string_options.read();

        if let Some(mask) = options.get(OPT_REMOVE_CODEC) {
            let patterns: Vec<String> =
                mask.split(',').map(|p| p.trim().to_string()).filter(|p| !p.is_empty()).collect();
            list.remove_masked(&patterns);
        }

        // Per-call codec option overrides: <format>:<option>=<value>
        let overrides = options.codec_overrides();
        drop(options);
        if !overrides.is_empty() {
            let mut adjusted = OrderedFormatList::new();
            for format in list {
                let mut format = format;
                for (name, option, value) in &overrides {
                    if tandem_media_core::format::list::wildcard_match(format.name(), name) {
                        if let Some(changed) = format.with_option_from_str(option, value) {
                            format = changed;
                        }
                    }
                }
                adjusted.add(format);
            }
            list = adjusted;
        }

        match self.call() {
            Some(call) => call.manager().adjust_media_formats(list),
            None => list,
        }
    }

    /// Open one media stream through the endpoint, debiting bandwidth.
    ///
    /// Sources debit the receive budget, sinks the transmit budget; the
    /// reservation returns when the stream closes.
    pub async fn open_media_stream(
        self: &Arc<Self>,
        format: &MediaFormat,
        session_id: u32,
        is_source: bool,
    ) -> Result<Arc<dyn MediaStream>> {
        if self.is_releasing() {
            return Err(Error::ConnectionReleased);
        }

        let needed = format.bandwidth();
        self.reserve_bandwidth(is_source, needed)?;

        let stream = match self
            .endpoint
            .create_media_stream(self, format, session_id, is_source)
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                self.return_bandwidth(is_source, needed);
                return Err(e);
            }
        };

        if let Err(e) = stream.open().await {
            // A stream that cannot open is closed and discarded
            stream.close().await;
            self.return_bandwidth(is_source, needed);
            return Err(e.into());
        }

        self.streams.write().await.push(StreamEntry {
            stream: stream.clone(),
            reserved: needed,
            is_source,
        });
        debug!(
            "Connection {} opened {} stream, session {} format {}",
            self.token,
            if is_source { "source" } else { "sink" },
            session_id,
            format
        );
        Ok(stream)
    }

    /// Close one stream and return its bandwidth reservation; used when
    /// the pairing sink could not be opened
    pub async fn discard_media_stream(&self, stream: &Arc<dyn MediaStream>) {
        let entry = {
            let mut streams = self.streams.write().await;
            streams
                .iter()
                .position(|e| Arc::ptr_eq(&e.stream, stream))
                .map(|pos| streams.remove(pos))
        };
        if let Some(entry) = entry {
            entry.stream.close().await;
            self.return_bandwidth(entry.is_source, entry.reserved);
        }
    }

    /// Streams currently owned by this connection
    pub async fn media_streams(&self) -> Vec<Arc<dyn MediaStream>> {
        self.streams.read().await.iter().map(|entry| entry.stream.clone()).collect()
    }

    /// A stream by session id and direction
    pub async fn find_media_stream(
        &self,
        session_id: u32,
        is_source: bool,
    ) -> Option<Arc<dyn MediaStream>> {
        self.streams
            .read()
            .await
            .iter()
            .find(|entry| entry.stream.session_id() == session_id && entry.is_source == is_source)
            .map(|entry| entry.stream.clone())
    }

    /// Track a patch whose source lives on this connection
    pub async fn add_patch(&self, patch: MediaPatch) {
        self.patches.write().await.push(patch);
    }

    /// Pause or resume every stream (hold implementation)
    pub async fn pause_media_streams(&self, paused: bool) {
        for entry in self.streams.read().await.iter() {
            entry.stream.set_paused(paused);
        }
    }

    /// Close all patches, streams and RTP sessions, returning bandwidth
    pub async fn close_media_streams(&self) {
        for patch in self.patches.write().await.drain(..) {
            patch.close().await;
        }
        let entries: Vec<StreamEntry> = self.streams.write().await.drain(..).collect();
        for entry in entries {
            entry.stream.close().await;
            self.return_bandwidth(entry.is_source, entry.reserved);
        }
        for (_, session) in self.rtp_sessions.write().await.drain() {
            session.close().await;
        }
    }

    // ------------------------------------------------------------------
    // RTP sessions
    // ------------------------------------------------------------------

    /// The RTP session for a session id, when one exists
    pub async fn rtp_session(&self, session_id: u32) -> Option<RtpSession> {
        self.rtp_sessions.read().await.get(&session_id).cloned()
    }

    /// Store the RTP session for a session id and record its SSRC
    pub async fn set_rtp_session(&self, session_id: u32, session: RtpSession) {
        self.ssrc_to_session.lock().insert(session.ssrc(), session_id);
        self.rtp_sessions.write().await.insert(session_id, session);
    }

    /// Session id owning an SSRC, per the SSRC/stream correspondence
    pub fn session_for_ssrc(&self, ssrc: RtpSsrc) -> Option<u32> {
        self.ssrc_to_session.lock().get(&ssrc).copied()
    }

    /// All RTP sessions of this connection
    pub async fn rtp_sessions(&self) -> Vec<RtpSession> {
        self.rtp_sessions.read().await.values().cloned().collect()
    }

    // ------------------------------------------------------------------
    // Bandwidth accounting
    // ------------------------------------------------------------------

    /// Set the rx/tx budgets in bits per second
    pub fn set_bandwidth_budgets(&self, rx: u64, tx: u64) {
        let mut bandwidth = self.bandwidth.lock();
        bandwidth.rx_budget = rx;
        bandwidth.tx_budget = tx;
    }

    /// Unallocated bandwidth in the given direction
    pub fn bandwidth_available(&self, receive: bool) -> u64 {
        let bandwidth = self.bandwidth.lock();
        if receive {
            bandwidth.rx_budget.saturating_sub(bandwidth.rx_used)
        } else {
            bandwidth.tx_budget.saturating_sub(bandwidth.tx_used)
        }
    }

    fn reserve_bandwidth(&self, receive: bool, amount: u64) -> Result<()> {
        let mut bandwidth = self.bandwidth.lock();
        let budget = if receive { bandwidth.rx_budget } else { bandwidth.tx_budget };
        let used = if receive { bandwidth.rx_used } else { bandwidth.tx_used };
        if used + amount > budget {
            warn!(
                "Connection {} over bandwidth: need {} bps, {} available",
                self.token,
                amount,
                budget - used
            );
            return Err(Error::NoBandwidth { needed: amount, available: budget - used });
        }
        if receive {
            bandwidth.rx_used += amount;
        } else {
            bandwidth.tx_used += amount;
        }
        Ok(())
    }

    fn return_bandwidth(&self, receive: bool, amount: u64) {
        let mut bandwidth = self.bandwidth.lock();
        if receive {
            bandwidth.rx_used = bandwidth.rx_used.saturating_sub(amount);
        } else {
            bandwidth.tx_used = bandwidth.tx_used.saturating_sub(amount);
        }
    }

    // ------------------------------------------------------------------
    // Auto-start
    // ------------------------------------------------------------------

    /// Open source streams for every media type both sides want.
    ///
    /// For each auto-start entry where this side offers transmit and the
    /// peer offers receive, ask the call to open a source stream here
    /// paired with a sink there.
    pub async fn auto_start_media_streams(self: &Arc<Self>, transfer: bool) {
        let Some(call) = self.call() else { return };
        let Some(peer) = call.other_connection(self) else { return };

        let ours = self.auto_start_map();
        let theirs = peer.auto_start_map();

        for (media_type, ours_direction) in ours {
            let theirs_direction = theirs.get(&media_type).copied().unwrap_or_default();
            if !ours_direction.offers_transmit() || !theirs_direction.offers_receive() {
                continue;
            }
            let session_id = session_id_for(media_type);
            if let Err(e) = call
                .open_source_media_streams(self, media_type, session_id, None, transfer)
                .await
            {
                warn!(
                    "Auto-start of {} for connection {} failed: {}",
                    media_type, self.token, e
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // User input
    // ------------------------------------------------------------------

    /// Send a whole string of user input via the signalling path
    pub async fn send_user_input_string(self: &Arc<Self>, text: &str) -> Result<()> {
        if self.is_releasing() {
            return Err(Error::ConnectionReleased);
        }
        let Some(call) = self.call() else { return Err(Error::ConnectionReleased) };
        call.manager()
            .notify_user_input(self, UserInput::Text(text.to_string()));
        Ok(())
    }

    /// Send one tone using the connection's user input mode.
    ///
    /// `Tone` mode emits an RFC 2833 event on the audio RTP session; the
    /// in-band mode queues a generated tone into the send path; the
    /// string and Q.931 modes deliver through signalling. No connection
    /// state changes in any mode.
    pub async fn send_user_input_tone(self: &Arc<Self>, digit: char, duration_ms: u32) -> Result<()> {
        if self.is_releasing() {
            return Err(Error::ConnectionReleased);
        }

        let mult = *self.dtmf_duration_mult.read() as u64;
        let div = *self.dtmf_duration_div.read() as u64;
        let duration_ms = ((duration_ms as u64 * mult) / div) as u32;

        match self.user_input_mode() {
            UserInputMode::Tone => {
                let session_id = session_id_for(MediaType::Audio);
                let session = self
                    .rtp_session(session_id)
                    .await
                    .ok_or_else(|| Error::Other("no audio RTP session for tone".to_string()))?;

                // Duration in timestamp units at the session clock
                let units_per_ms = (session.clock_rate() / 1000).max(1);
                let duration =
                    duration_ms.saturating_mul(units_per_ms).min(u16::MAX as u32) as u16;
                let event = Rfc2833Event::for_digit(digit, duration)
                    .ok_or_else(|| Error::Other(format!("not a DTMF digit: {:?}", digit)))?;

                // Start packet with marker, then the end packet
                let mut start = RtpPacket::new(
                    RtpHeader::new(RFC2833_PAYLOAD_TYPE, 0, 0, 0),
                    event.encode(),
                );
                start.header.marker = true;
                session.write_oob_data(&mut start, true).await?;

                // End packets carry the event's start timestamp
                let mut fin = event;
                fin.end = true;
                let mut end_packet = RtpPacket::new(
                    RtpHeader::new(RFC2833_PAYLOAD_TYPE, 0, start.header.timestamp, 0),
                    fin.encode(),
                );
                session.write_oob_data(&mut end_packet, false).await?;

                debug!(
                    "Connection {} sent RFC2833 event {} duration {}",
                    self.token, event.event, duration
                );
                Ok(())
            }
            UserInputMode::InBand => {
                let injector = self.dtmf_injector();
                injector.queue_digit(digit, duration_ms);
                Ok(())
            }
            UserInputMode::String | UserInputMode::Q931 => {
                let Some(call) = self.call() else { return Err(Error::ConnectionReleased) };
                call.manager()
                    .notify_user_input(self, UserInput::Tone { digit, duration_ms });
                Ok(())
            }
        }
    }

    /// The in-band tone injector, created on first use
    pub fn dtmf_injector(&self) -> Arc<DtmfInjector> {
        self.dtmf_injector
            .lock()
            .get_or_insert_with(DtmfInjector::new)
            .clone()
    }

    // ------------------------------------------------------------------
    // Hold
    // ------------------------------------------------------------------

    /// Place on hold or retrieve. `from_remote` records which side did it.
    pub async fn set_hold(self: &Arc<Self>, from_remote: bool, on_hold: bool) {
        let flag = if from_remote { &self.hold_remote } else { &self.hold_local };
        if flag.swap(on_hold, Ordering::Relaxed) == on_hold {
            return; // No change
        }
        self.pause_media_streams(on_hold).await;
        if let Some(call) = self.call() {
            call.manager().notify_hold(self, from_remote, on_hold);
        }
        info!(
            "Connection {} {} by {}",
            self.token,
            if on_hold { "held" } else { "retrieved" },
            if from_remote { "remote" } else { "local" }
        );
    }

    /// True when either side has the connection on hold
    pub fn is_on_hold(&self) -> bool {
        self.hold_local.load(Ordering::Relaxed) || self.hold_remote.load(Ordering::Relaxed)
    }

    /// Forward the call: release this connection and have the call dial
    /// the new address in its place
    pub async fn forward(self: &Arc<Self>, address: &str) -> Result<()> {
        let Some(call) = self.call() else { return Err(Error::ConnectionReleased) };
        call.forward_connection(self, address).await
    }
}

fn default_auto_start() -> AutoStartMap {
    let mut map = AutoStartMap::new();
    map.insert(MediaType::Audio, crate::options::AutoStartDirection::SendReceive);
    map
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Connection({}, {:?})", self.token, self.phase())
    }
}

/// Build an RFC 2833 packet pair for tests and protocol simulators
pub fn rfc2833_packets(digit: char, duration: u16) -> Option<(Bytes, Bytes)> {
    let event = Rfc2833Event::for_digit(digit, duration)?;
    let mut fin = event;
    fin.end = true;
    Some((event.encode(), fin.encode()))
}
