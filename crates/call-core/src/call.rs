//! Call
//!
//! The shared container of the (usually two) connections that belong to
//! one conversation. The call bridges media between its connections,
//! fans lifecycle events out to all of them, and is torn down by the
//! manager's garbage collector once every connection has released.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use tandem_media_core::filters::{recording_tap, SilenceDetectMode};
use tandem_media_core::format::{MediaFormat, MediaType};
use tandem_media_core::{MediaPatch, OrderedFormatList};

use crate::connection::Connection;
use crate::error::{CallEndReason, Error, Result};
use crate::manager::Manager;
use crate::options::{UserInputMode, OPT_RECORD_AUDIO};
use crate::phase::Phase;

/// A conversation between two or more connections
pub struct Call {
    token: String,
    manager: Weak<Manager>,

    connections: RwLock<Vec<Arc<Connection>>>,
    party_a: RwLock<String>,
    party_b: RwLock<String>,

    start_time: Instant,
    established_time: Mutex<Option<Instant>>,
    end_time: Mutex<Option<Instant>>,
    end_reason: Mutex<Option<CallEndReason>>,

    established: AtomicBool,
    media_started: AtomicBool,
    switching_t38: AtomicBool,
    cleared: Notify,

    recordings: Mutex<std::collections::HashMap<String, Arc<parking_lot::Mutex<Vec<u8>>>>>,
}

impl Call {
    /// Create an empty call; the manager registers it by token
    pub fn new(manager: &Arc<Manager>, token: String) -> Arc<Self> {
        debug!("Created call {}", token);
        Arc::new(Self {
            token,
            manager: Arc::downgrade(manager),
            connections: RwLock::new(Vec::new()),
            party_a: RwLock::new(String::new()),
            party_b: RwLock::new(String::new()),
            start_time: Instant::now(),
            established_time: Mutex::new(None),
            end_time: Mutex::new(None),
            end_reason: Mutex::new(None),
            established: AtomicBool::new(false),
            media_started: AtomicBool::new(false),
            switching_t38: AtomicBool::new(false),
            cleared: Notify::new(),
            recordings: Mutex::new(std::collections::HashMap::new()),
        })
    }

    /// Process-unique token
    pub fn token(&self) -> &str {
        &self.token
    }

    /// The owning manager; panics after manager teardown
    pub fn manager(&self) -> Arc<Manager> {
        self.manager.upgrade().expect("manager outlives calls")
    }

    /// Symbolic A party label
    pub fn party_a(&self) -> String {
        self.party_a.read().clone()
    }

    /// Symbolic B party label
    pub fn party_b(&self) -> String {
        self.party_b.read().clone()
    }

    /// Set the A party label
    pub fn set_party_a(&self, party: &str) {
        *self.party_a.write() = party.to_string();
    }

    /// Set the B party label (pre-routing destination)
    pub fn set_party_b(&self, party: &str) {
        *self.party_b.write() = party.to_string();
    }

    /// When the call started
    pub fn start_time(&self) -> Instant {
        self.start_time
    }

    /// When the call became fully established, if it did
    pub fn established_time(&self) -> Option<Instant> {
        *self.established_time.lock()
    }

    /// When the call finished clearing, if it has
    pub fn end_time(&self) -> Option<Instant> {
        *self.end_time.lock()
    }

    /// Why the call ended; first setter wins
    pub fn end_reason(&self) -> Option<CallEndReason> {
        *self.end_reason.lock()
    }

    /// Record the end reason unless one is already set
    pub fn set_end_reason(&self, reason: CallEndReason) {
        let mut slot = self.end_reason.lock();
        if slot.is_none() {
            *slot = Some(reason);
        }
    }

    /// T.38 fax switch-over in progress
    pub fn is_switching_t38(&self) -> bool {
        self.switching_t38.load(Ordering::Relaxed)
    }

    /// Mark or clear the T.38 switch-over flag
    pub fn set_switching_t38(&self, switching: bool) {
        self.switching_t38.store(switching, Ordering::Relaxed);
    }

    // ------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------

    /// Attach a connection; exclusive topology change
    pub fn add_connection(&self, connection: Arc<Connection>) {
        self.connections.write().push(connection);
    }

    /// All connections, live and releasing
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.read().clone()
    }

    /// Number of connections not yet released
    pub fn connection_count(&self) -> usize {
        self.connections.read().iter().filter(|c| !c.is_released()).count()
    }

    /// Connection by position
    pub fn get_connection(&self, index: usize) -> Option<Arc<Connection>> {
        self.connections.read().get(index).cloned()
    }

    /// The peer of a connection in a two-party call; in conferences the
    /// first other live connection
    pub fn other_connection(&self, connection: &Arc<Connection>) -> Option<Arc<Connection>> {
        self.connections
            .read()
            .iter()
            .find(|other| !Arc::ptr_eq(other, connection) && !other.is_released())
            .cloned()
    }

    /// Every connection has fully established
    pub fn is_established(&self) -> bool {
        self.established.load(Ordering::Relaxed)
    }

    /// Every connection is released (or none were ever attached)
    pub fn is_cleared(&self) -> bool {
        self.connections.read().iter().all(|c| c.is_released())
    }

    // ------------------------------------------------------------------
    // Lifecycle fan-out
    // ------------------------------------------------------------------

    /// A connection entered `Proceeding`
    pub fn on_proceeding(&self, connection: &Arc<Connection>) {
        debug!("Call {} proceeding on {}", self.token, connection.token());
        self.manager().notify_proceeding(connection);
    }

    /// A connection entered `Alerting`; the peer is told so it can play
    /// ring-back, with early media when `with_media`
    pub async fn on_alerting(&self, connection: &Arc<Connection>, with_media: bool) {
        debug!(
            "Call {} alerting on {}{}",
            self.token,
            connection.token(),
            if with_media { " with media" } else { "" }
        );
        self.manager().notify_alerting(connection);

        if let Some(peer) = self.other_connection(connection) {
            peer.set_phase(Phase::Alerting);
        }
    }

    /// A connection answered. The peer is answered too, and once every
    /// connection is connected the media streams are auto-started.
    pub async fn on_connected(&self, connection: &Arc<Connection>) {
        debug!("Call {} connected on {}", self.token, connection.token());
        self.manager().notify_connected(connection);

        if let Some(peer) = self.other_connection(connection) {
            if peer.phase() < Phase::Connected {
                Box::pin(peer.on_connected()).await;
                return; // The peer's pass re-enters here with both connected
            }
        }

        // All connected: start media exactly once
        let all_connected = self
            .connections()
            .iter()
            .filter(|c| !c.is_released())
            .all(|c| c.phase() >= Phase::Connected);
        if all_connected && !self.media_started.swap(true, Ordering::SeqCst) {
            for connection in self.connections() {
                if !connection.is_released() {
                    connection.auto_start_media_streams(false).await;
                }
            }
            // Streams may all be open already; re-check both sides
            for connection in self.connections() {
                if !connection.is_released() {
                    connection.check_established().await;
                }
            }
        }
    }

    /// A connection reached `Established`; when all have, the call is up
    pub async fn on_established(&self, connection: &Arc<Connection>) {
        debug!("Call {} established on {}", self.token, connection.token());
        let all = self
            .connections()
            .iter()
            .filter(|c| !c.is_released())
            .all(|c| c.phase() == Phase::Established);
        if all && !self.established.swap(true, Ordering::SeqCst) {
            *self.established_time.lock() = Some(Instant::now());
            info!(
                "Call {} established between \"{}\" and \"{}\"",
                self.token,
                self.party_a(),
                self.party_b()
            );
            if let Some(call) = self.manager().find_call(&self.token) {
                self.manager().notify_established_call(&call);
            }
        }
    }

    /// A connection finished releasing. In a two-party call the peer is
    /// released as well; the garbage collector reclaims the call once
    /// everything is down.
    pub async fn on_connection_released(&self, connection: &Arc<Connection>) {
        let reason = connection
            .end_reason()
            .unwrap_or(CallEndReason::LocalUser);

        let peers: Vec<Arc<Connection>> = self
            .connections
            .read()
            .iter()
            .filter(|other| !Arc::ptr_eq(other, connection) && !other.is_released())
            .cloned()
            .collect();

        // Two party call: the peer goes down with the reflected reason
        if peers.len() == 1 {
            peers[0].release(reason.as_peer_reason(), false).await;
        }

        if self.is_cleared() {
            let mut end = self.end_time.lock();
            if end.is_none() {
                *end = Some(Instant::now());
            }
        }
    }

    /// Mark the call cleared and wake synchronous waiters; called by the
    /// garbage collector after removal from the active set
    pub(crate) fn finalize_cleared(&self) {
        self.cleared.notify_waiters();
    }

    /// Clear the call: every connection is marked for release and the
    /// garbage collector performs the teardown
    pub async fn clear(&self, reason: CallEndReason) {
        info!("Clearing call {} ({})", self.token, reason);
        self.set_end_reason(reason);
        for connection in self.connections() {
            connection.release(reason, false).await;
        }
    }

    /// Clear and block until the garbage collector reclaimed the call
    pub async fn clear_sync(&self, reason: CallEndReason) {
        let manager = self.manager();
        self.clear(reason).await;
        // The notify can race the collector's sweep, so poll the active
        // set as the ground truth
        while manager.find_call(&self.token).is_some() {
            let _ = tokio::time::timeout(
                std::time::Duration::from_millis(100),
                self.cleared.notified(),
            )
            .await;
        }
    }

    // ------------------------------------------------------------------
    // Media bridging
    // ------------------------------------------------------------------

    /// Open a source stream on `from` paired with a sink on the peer via
    /// a new patch, negotiating the format from both sides' capabilities.
    ///
    /// Idempotent per (connection, session): an existing open source
    /// stream is left alone. With symmetric media enabled the reverse
    /// direction is opened in the same pass, or the forward one is torn
    /// down again.
    pub async fn open_source_media_streams(
        self: &Arc<Self>,
        from: &Arc<Connection>,
        media_type: MediaType,
        session_id: u32,
        preferred: Option<&MediaFormat>,
        transfer: bool,
    ) -> Result<()> {
        if from.find_media_stream(session_id, true).await.is_some() {
            return Ok(()); // Already open
        }
        let to = self
            .other_connection(from)
            .ok_or_else(|| Error::Other("no peer connection for media".to_string()))?;

        let format = match preferred {
            Some(format) => format.clone(),
            None => self.select_format(from, &to, media_type)?,
        };
        debug!(
            "Call {} opening {} session {} \"{}\" from {} to {}",
            self.token,
            media_type,
            session_id,
            format,
            from.token(),
            to.token()
        );

        let source = from.open_media_stream(&format, session_id, true).await?;
        let sink = match to.open_media_stream(&format, session_id, false).await {
            Ok(sink) => sink,
            Err(e) => {
                from.discard_media_stream(&source).await;
                return Err(e);
            }
        };

        let manager = self.manager();
        let patch = MediaPatch::new(source);
        self.install_filters(&patch, from, &format);
        patch.add_sink(sink, manager.transcoders()).await?;
        patch.start();
        from.add_patch(patch).await;

        if manager.symmetric_media() {
            // Media must flow in both directions or neither; the nested
            // call terminates because this direction now exists
            if let Err(e) = Box::pin(self.open_source_media_streams(
                &to,
                media_type,
                session_id,
                Some(&format),
                transfer,
            ))
            .await
            {
                warn!("Symmetric media open failed, closing forward direction: {}", e);
                from.close_media_streams().await;
                return Err(e);
            }
        }

        from.check_established().await;
        to.check_established().await;
        Ok(())
    }

    /// Intersect both sides' capabilities for a media type and take the
    /// most preferred survivor
    fn select_format(
        &self,
        from: &Arc<Connection>,
        to: &Arc<Connection>,
        media_type: MediaType,
    ) -> Result<MediaFormat> {
        let mut offered: OrderedFormatList = from
            .media_formats()
            .into_iter()
            .filter(|f| f.media_type() == media_type)
            .collect();
        let answered: OrderedFormatList = to
            .media_formats()
            .into_iter()
            .filter(|f| f.media_type() == media_type)
            .collect();
        offered.intersect(&answered);

        let local = offered
            .first()
            .cloned()
            .ok_or_else(|| Error::NoCommonFormats(media_type.to_string()))?;

        // Apply the per-option merge rules against the answer side's copy
        match answered.find(local.name()) {
            Some(remote) => Ok(local.merge(remote)?),
            None => Ok(local),
        }
    }

    /// Wire the per-connection audio filters onto a new patch
    fn install_filters(&self, patch: &MediaPatch, from: &Arc<Connection>, format: &MediaFormat) {
        if format.media_type() != MediaType::Audio {
            return;
        }

        // Filters are keyed by format so a renegotiation can remove them
        let silence_mode = from.silence_mode();
        if silence_mode != SilenceDetectMode::None {
            let detector = tandem_media_core::SilenceDetector::new(silence_mode);
            patch.add_filter(format, detector.into_filter());
        }

        if from.user_input_mode() == UserInputMode::InBand {
            patch.add_filter(format, from.dtmf_injector().into_filter());
        }

        // Raw PCM sources get sample level DTMF detection so digits from
        // soundcard style endpoints surface as user input
        if format.name() == tandem_media_core::format::names::PCM16 {
            let detector = tandem_media_core::DtmfDetector::new();
            let connection = from.clone();
            detector.on_digit(Arc::new(move |digit| {
                if let Some(call) = connection.call() {
                    call.manager().notify_user_input(
                        &connection,
                        crate::connection::UserInput::Tone { digit, duration_ms: 0 },
                    );
                }
            }));
            patch.add_filter(format, detector.into_filter());
        }

        if let Some(key) = from.string_options().get(OPT_RECORD_AUDIO) {
            let buffer = self.recording_buffer(key);
            patch.add_filter(format, recording_tap(buffer));
        }
    }

    /// The recording buffer for a key, created on first use
    pub fn recording_buffer(&self, key: &str) -> Arc<parking_lot::Mutex<Vec<u8>>> {
        self.recordings
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(parking_lot::Mutex::new(Vec::new())))
            .clone()
    }

    /// Recording keys active on this call
    pub fn recording_keys(&self) -> Vec<String> {
        self.recordings.lock().keys().cloned().collect()
    }

    // ------------------------------------------------------------------
    // Forwarding
    // ------------------------------------------------------------------

    /// Replace `old` with a freshly dialled connection to `address`
    pub async fn forward_connection(
        self: &Arc<Self>,
        old: &Arc<Connection>,
        address: &str,
    ) -> Result<()> {
        info!(
            "Call {} forwarding {} to \"{}\"",
            self.token,
            old.token(),
            address
        );
        let manager = self.manager();
        let options = old.string_options();

        // Add the replacement before releasing the old leg so the peer
        // release logic does not see a two-party call collapse
        let replacement = manager.make_connection(self, address, false, &options).await?;
        old.release(CallEndReason::CallForwarded, false).await;
        replacement.set_up().await
    }
}

impl std::fmt::Debug for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Call({})", self.token)
    }
}
