//! Manager
//!
//! Top level coordinator: owns the endpoint registry, the active call
//! dictionary, the route table, NAT methods, port ranges, media defaults
//! and the garbage collector that reclaims released calls. Applications
//! drive it through `set_up_call`/`clear_call` and observe it through
//! the observer traits.

use std::collections::{BTreeMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use tandem_media_core::format::MediaType;
use tandem_media_core::{FormatRegistry, OrderedFormatList, TranscoderRegistry};
use tandem_transport_core::nat::NatMethods;
use tandem_transport_core::ports::PortRange;
use tandem_transport_core::TransportTimeouts;

use crate::call::Call;
use crate::connection::{Connection, JitterSettings, UserInput};
use crate::endpoint::{Endpoint, ProductInfo};
use crate::error::{CallEndReason, Error, Result};
use crate::options::StringOptions;
use crate::routing::{split_scheme, RouteTable};
use crate::token::{TokenGenerator, CALL_TOKEN_PREFIX, CONNECTION_TOKEN_PREFIX};

/// Interval of the garbage collector sweep
const GARBAGE_COLLECT_INTERVAL: Duration = Duration::from_secs(1);

/// Grace period before an empty call (no connection ever attached) is
/// considered leaked and reclaimed
const EMPTY_CALL_GRACE: Duration = Duration::from_secs(10);

/// Application callbacks for call lifecycle events
pub trait CallObserver: Send + Sync {
    /// A connection entered `Proceeding`
    fn on_proceeding(&self, _connection: &Arc<Connection>) {}

    /// A connection entered `Alerting`
    fn on_alerting(&self, _connection: &Arc<Connection>) {}

    /// A connection answered
    fn on_connected(&self, _connection: &Arc<Connection>) {}

    /// Every connection of the call is established
    fn on_established_call(&self, _call: &Arc<Call>) {}

    /// A connection finished releasing
    fn on_connection_released(&self, _connection: &Arc<Connection>) {}

    /// The call was reclaimed; end reason and phase times are final
    fn on_cleared_call(&self, _call: &Arc<Call>) {}

    /// User input arrived from or for a connection
    fn on_user_input(&self, _connection: &Arc<Connection>, _input: &UserInput) {}

    /// Hold state changed
    fn on_hold(&self, _connection: &Arc<Connection>, _from_remote: bool, _on_hold: bool) {}
}

/// Application callbacks for media plane events
pub trait MediaObserver: Send + Sync {
    /// A media stream opened on a connection
    fn on_media_stream_opened(
        &self,
        _connection: &Arc<Connection>,
        _session_id: u32,
        _is_source: bool,
    ) {
    }
}

/// Manager wide configuration
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Default local party name for new endpoints
    pub default_user_name: String,

    /// Default display name for new endpoints
    pub default_display_name: String,

    /// Identity advertised in signalling
    pub product_info: ProductInfo,

    /// Signalling TCP port range (base, max)
    pub tcp_ports: (u16, u16),

    /// Signalling UDP port range (base, max)
    pub udp_ports: (u16, u16),

    /// RTP/RTCP port range (base, max); pairs are even/odd
    pub rtp_ports: (u16, u16),

    /// Local address RTP sessions bind to
    pub rtp_bind_address: IpAddr,

    /// DSCP value per media type
    pub media_qos: BTreeMap<MediaType, u8>,

    /// Jitter buffer defaults applied to new connections
    pub default_jitter: JitterSettings,

    /// Preferred media format order (wildcards allowed)
    pub media_format_order: Vec<String>,

    /// Media formats removed everywhere (wildcards allowed)
    pub media_format_mask: Vec<String>,

    /// Per-direction bandwidth budget for new connections, bits/second
    pub default_bandwidth: u64,

    /// Open media in both directions together or not at all
    pub symmetric_media: bool,

    /// Transport idle/signalling timeouts handed to listeners
    pub timeouts: TransportTimeouts,

    /// Clear a call when its media stops for this long
    pub no_media_timeout: Duration,

    /// TLS credentials for tls/wss listeners
    #[cfg(feature = "tls")]
    pub tls: tandem_transport_core::transport::tls::TlsContext,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        let mut media_qos = BTreeMap::new();
        media_qos.insert(MediaType::Audio, 46); // EF
        media_qos.insert(MediaType::Video, 34); // AF41
        media_qos.insert(MediaType::Data, 0);
        Self {
            default_user_name: whoami(),
            default_display_name: whoami(),
            product_info: ProductInfo {
                vendor: "tandem".to_string(),
                name: "tandem".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            tcp_ports: (0, 0),
            udp_ports: (0, 0),
            rtp_ports: (0, 0),
            rtp_bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            media_qos,
            default_jitter: JitterSettings::default(),
            media_format_order: Vec::new(),
            media_format_mask: Vec::new(),
            default_bandwidth: 10_000_000,
            symmetric_media: true,
            timeouts: TransportTimeouts::default(),
            no_media_timeout: Duration::from_secs(300),
            #[cfg(feature = "tls")]
            tls: Default::default(),
        }
    }
}

/// Top level coordinator for endpoints, calls and routing
pub struct Manager {
    config: ManagerConfig,
    endpoints: RwLock<Vec<Arc<dyn Endpoint>>>,
    active_calls: DashMap<String, Arc<Call>>,
    route_table: Mutex<RouteTable>,
    nat_methods: RwLock<NatMethods>,
    tcp_ports: PortRange,
    udp_ports: PortRange,
    rtp_ports: PortRange,
    formats: FormatRegistry,
    transcoders: TranscoderRegistry,
    tokens: TokenGenerator,
    call_observers: RwLock<Vec<Arc<dyn CallObserver>>>,
    media_observers: RwLock<Vec<Arc<dyn MediaObserver>>>,
    clearing_all_count: AtomicUsize,
    clearing_all_mutex: tokio::sync::Mutex<()>,
    all_calls_cleared: Notify,
    garbage_collector: Mutex<Option<JoinHandle<()>>>,
}

impl Manager {
    /// Create a manager; the garbage collector starts with the first
    /// attached endpoint
    pub fn new(config: ManagerConfig) -> Arc<Self> {
        Arc::new(Self {
            tcp_ports: PortRange::new(config.tcp_ports.0, config.tcp_ports.1),
            udp_ports: PortRange::new(config.udp_ports.0, config.udp_ports.1),
            rtp_ports: PortRange::new(config.rtp_ports.0, config.rtp_ports.1),
            config,
            endpoints: RwLock::new(Vec::new()),
            active_calls: DashMap::new(),
            route_table: Mutex::new(RouteTable::new()),
            nat_methods: RwLock::new(NatMethods::new()),
            formats: FormatRegistry::with_standard_formats(),
            transcoders: TranscoderRegistry::new(),
            tokens: TokenGenerator::new(),
            call_observers: RwLock::new(Vec::new()),
            media_observers: RwLock::new(Vec::new()),
            clearing_all_count: AtomicUsize::new(0),
            clearing_all_mutex: tokio::sync::Mutex::new(()),
            all_calls_cleared: Notify::new(),
            garbage_collector: Mutex::new(None),
        })
    }

    // ------------------------------------------------------------------
    // Configuration accessors
    // ------------------------------------------------------------------

    /// Default local party name
    pub fn default_user_name(&self) -> String {
        self.config.default_user_name.clone()
    }

    /// Default display name
    pub fn default_display_name(&self) -> String {
        self.config.default_display_name.clone()
    }

    /// Advertised product identity
    pub fn product_info(&self) -> ProductInfo {
        self.config.product_info.clone()
    }

    /// Jitter defaults for new connections
    pub fn default_jitter(&self) -> JitterSettings {
        self.config.default_jitter
    }

    /// Per-direction bandwidth budget for new connections
    pub fn default_bandwidth(&self) -> u64 {
        self.config.default_bandwidth
    }

    /// Whether media opens in both directions together
    pub fn symmetric_media(&self) -> bool {
        self.config.symmetric_media
    }

    /// Address RTP sessions bind to
    pub fn rtp_bind_address(&self) -> IpAddr {
        self.config.rtp_bind_address
    }

    /// The RTP/RTCP port range
    pub fn rtp_port_range(&self) -> &PortRange {
        &self.rtp_ports
    }

    /// The signalling TCP port range
    pub fn tcp_port_range(&self) -> &PortRange {
        &self.tcp_ports
    }

    /// The signalling UDP port range
    pub fn udp_port_range(&self) -> &PortRange {
        &self.udp_ports
    }

    /// DSCP value for a media type
    pub fn dscp_for(&self, media_type: MediaType) -> u8 {
        self.config.media_qos.get(&media_type).copied().unwrap_or(0)
    }

    /// Transport timeouts for listeners
    pub fn timeouts(&self) -> TransportTimeouts {
        self.config.timeouts.clone()
    }

    /// Media format catalog owned by this manager
    pub fn formats(&self) -> &FormatRegistry {
        &self.formats
    }

    /// Transcoder factory registry
    pub fn transcoders(&self) -> &TranscoderRegistry {
        &self.transcoders
    }

    /// Snapshot of the NAT methods
    pub fn nat_methods(&self) -> NatMethods {
        self.nat_methods.read().clone()
    }

    /// Add a NAT traversal method
    pub fn add_nat_method(&self, method: Arc<dyn tandem_transport_core::NatMethod>) {
        self.nat_methods.write().add(method);
    }

    /// Next connection token
    pub fn next_connection_token(&self) -> String {
        self.tokens.next(CONNECTION_TOKEN_PREFIX)
    }

    /// Apply the configured preference order and global mask to a
    /// capability list
    pub fn adjust_media_formats(&self, mut list: OrderedFormatList) -> OrderedFormatList {
        if !self.config.media_format_mask.is_empty() {
            list.remove_masked(&self.config.media_format_mask);
        }
        if !self.config.media_format_order.is_empty() {
            list.reorder(&self.config.media_format_order);
        }
        list
    }

    // ------------------------------------------------------------------
    // Observers
    // ------------------------------------------------------------------

    /// Register a call lifecycle observer
    pub fn add_call_observer(&self, observer: Arc<dyn CallObserver>) {
        self.call_observers.write().push(observer);
    }

    /// Register a media plane observer
    pub fn add_media_observer(&self, observer: Arc<dyn MediaObserver>) {
        self.media_observers.write().push(observer);
    }

    fn each_observer(&self, f: impl Fn(&Arc<dyn CallObserver>)) {
        for observer in self.call_observers.read().iter() {
            f(observer);
        }
    }

    pub(crate) fn notify_proceeding(&self, connection: &Arc<Connection>) {
        self.each_observer(|o| o.on_proceeding(connection));
    }

    pub(crate) fn notify_alerting(&self, connection: &Arc<Connection>) {
        self.each_observer(|o| o.on_alerting(connection));
    }

    pub(crate) fn notify_connected(&self, connection: &Arc<Connection>) {
        self.each_observer(|o| o.on_connected(connection));
    }

    pub(crate) fn notify_established_call(&self, call: &Arc<Call>) {
        self.each_observer(|o| o.on_established_call(call));
    }

    pub(crate) fn notify_connection_released(&self, connection: &Arc<Connection>) {
        self.each_observer(|o| o.on_connection_released(connection));
    }

    pub(crate) fn notify_user_input(&self, connection: &Arc<Connection>, input: UserInput) {
        self.each_observer(|o| o.on_user_input(connection, &input));
    }

    pub(crate) fn notify_hold(&self, connection: &Arc<Connection>, from_remote: bool, on_hold: bool) {
        self.each_observer(|o| o.on_hold(connection, from_remote, on_hold));
    }

    /// Media stream opened notification, called by endpoints
    pub fn notify_media_stream_opened(
        &self,
        connection: &Arc<Connection>,
        session_id: u32,
        is_source: bool,
    ) {
        for observer in self.media_observers.read().iter() {
            observer.on_media_stream_opened(connection, session_id, is_source);
        }
    }

    // ------------------------------------------------------------------
    // Endpoints
    // ------------------------------------------------------------------

    /// Register an endpoint; starts the garbage collector on first use
    pub fn attach_endpoint(self: &Arc<Self>, endpoint: Arc<dyn Endpoint>) {
        info!("Attached endpoint \"{}\"", endpoint.core().prefix());
        self.endpoints.write().push(endpoint);
        self.ensure_garbage_collector();
    }

    /// Endpoint registered for a scheme prefix
    pub fn find_endpoint(&self, scheme: &str) -> Option<Arc<dyn Endpoint>> {
        self.endpoints
            .read()
            .iter()
            .find(|ep| ep.core().prefix().eq_ignore_ascii_case(scheme))
            .cloned()
    }

    /// All registered endpoints
    pub fn endpoints(&self) -> Vec<Arc<dyn Endpoint>> {
        self.endpoints.read().clone()
    }

    /// A connection by token, searching every endpoint
    pub fn find_connection(&self, token: &str) -> Option<Arc<Connection>> {
        self.endpoints
            .read()
            .iter()
            .find_map(|ep| ep.core().find_connection(token))
    }

    // ------------------------------------------------------------------
    // Routing table
    // ------------------------------------------------------------------

    /// Append a route from a configuration line
    pub fn add_route(&self, spec: &str) -> Result<()> {
        self.route_table.lock().add_spec(spec)
    }

    /// Replace the whole route table
    pub fn set_route_table(&self, specs: &[String]) -> Result<()> {
        self.route_table.lock().set_from_specs(specs)
    }

    /// Number of route entries
    pub fn route_count(&self) -> usize {
        self.route_table.lock().len()
    }

    // ------------------------------------------------------------------
    // Call setup
    // ------------------------------------------------------------------

    /// Start a call from `party_a` to `party_b`.
    ///
    /// Builds the A party connection and either runs its set-up (and the
    /// routing to the B party) on this task when `synchronous`, or hands
    /// it to a worker. Returns the call, whose token identifies it from
    /// here on.
    pub async fn set_up_call(
        self: &Arc<Self>,
        party_a: &str,
        party_b: &str,
        options: &StringOptions,
        synchronous: bool,
    ) -> Result<Arc<Call>> {
        info!("Set up call from \"{}\" to \"{}\"", party_a, party_b);
        let call = self.internal_create_call()?;
        call.set_party_a(party_a.trim());
        call.set_party_b(party_b.trim());

        match self.make_connection(&call, party_a.trim(), true, options).await {
            Ok(connection) => {
                if synchronous {
                    if let Err(e) = connection.set_up().await {
                        warn!("Call set-up failed: {}", e);
                        let reason =
                            call.end_reason().unwrap_or(CallEndReason::TemporaryFailure);
                        call.clear(reason).await;
                        return Err(e);
                    }
                } else {
                    let connection = connection.clone();
                    let call_for_task = call.clone();
                    tokio::spawn(async move {
                        if let Err(e) = connection.set_up().await {
                            warn!("Call set-up failed: {}", e);
                            let reason = call_for_task
                                .end_reason()
                                .unwrap_or(CallEndReason::TemporaryFailure);
                            call_for_task.clear(reason).await;
                        }
                    });
                }
                Ok(call)
            }
            Err(e) => {
                warn!("Could not create connection for \"{}\": {}", party_a, e);
                let reason = call.end_reason().unwrap_or(CallEndReason::TemporaryFailure);
                call.clear(reason).await;
                Err(e)
            }
        }
    }

    /// Container for a call arriving from the network; the accepting
    /// endpoint attaches the originating connection itself
    pub fn new_incoming_call_container(self: &Arc<Self>) -> Result<Arc<Call>> {
        self.internal_create_call()
    }

    fn internal_create_call(self: &Arc<Self>) -> Result<Arc<Call>> {
        if self.clearing_all_count.load(Ordering::SeqCst) != 0 {
            debug!("Create call refused while clearing all calls");
            return Err(Error::ClearingAll);
        }
        let call = Call::new(self, self.tokens.next(CALL_TOKEN_PREFIX));
        self.active_calls.insert(call.token().to_string(), call.clone());
        Ok(call)
    }

    /// Build a connection for a party string on whichever endpoint owns
    /// its scheme
    pub async fn make_connection(
        self: &Arc<Self>,
        call: &Arc<Call>,
        party: &str,
        originating: bool,
        options: &StringOptions,
    ) -> Result<Arc<Connection>> {
        debug!("Set up connection to \"{}\"", party);
        let scheme = split_scheme(party)
            .map(|(scheme, _)| scheme.to_string())
            .ok_or_else(|| Error::NoEndPoint(party.to_string()))?;
        let endpoint = self
            .find_endpoint(&scheme)
            .ok_or_else(|| Error::NoEndPoint(party.to_string()))?;
        endpoint.make_connection(call, party, originating, options).await
    }

    /// Routing entry point: an originating connection needs a B party.
    ///
    /// Applies the route table and builds the destination connection on
    /// the matched endpoint. On failure the originating connection is
    /// released with `NoUser` (no route to destination).
    pub async fn on_incoming_connection(
        self: &Arc<Self>,
        connection: &Arc<Connection>,
    ) -> Result<()> {
        debug!("Incoming connection {}", connection.token());
        connection.apply_string_options();

        let call = connection.call().ok_or(Error::ConnectionReleased)?;
        if call.other_connection(connection).is_some() {
            return Ok(()); // B party pre-built
        }

        // Pre-allocated B party, else whatever the signalling carried
        let destination = {
            let party_b = call.party_b();
            if party_b.is_empty() {
                connection.destination_address().unwrap_or_default()
            } else {
                party_b
            }
        };
        if destination.is_empty() {
            warn!("Cannot complete call, no destination address");
            connection.release(CallEndReason::NoUser, false).await;
            return Err(Error::NoRoute(String::new()));
        }

        let a_party = connection.remote_party_url();
        let options = connection.string_options();
        let mut routes_tried = HashSet::new();
        if self
            .on_route_connection(&mut routes_tried, &a_party, &destination, &call, &options)
            .await
        {
            Ok(())
        } else {
            info!("Could not route a=\"{}\" b=\"{}\"", a_party, destination);
            connection.release(CallEndReason::NoUser, false).await;
            Err(Error::NoRoute(destination))
        }
    }

    /// Walk the route table, trying each translated destination until a
    /// connection sticks. Destinations already tried are skipped so
    /// rewrite cycles terminate.
    async fn on_route_connection(
        self: &Arc<Self>,
        routes_tried: &mut HashSet<String>,
        a_party: &str,
        b_party: &str,
        call: &Arc<Call>,
        options: &StringOptions,
    ) -> bool {
        let mut route_index = 0usize;
        loop {
            let route = {
                let table = self.route_table.lock();
                let scheme_exists = |scheme: &str| self.find_endpoint(scheme).is_some();
                table.apply(a_party, b_party, &mut route_index, &scheme_exists)
            };

            let Some(route) = route else {
                if a_party == b_party {
                    trace!("Circular route a=b=\"{}\"", a_party);
                    return false;
                }

                // B party with an explicit scheme goes straight out
                if let Some((scheme, _)) = split_scheme(b_party) {
                    if self.find_endpoint(scheme).is_some() {
                        return self.try_destination(call, b_party, options).await;
                    }
                }

                // No scheme: first endpoint fitting the call's topology
                if split_scheme(b_party).is_none() {
                    let candidate = {
                        let endpoints = self.endpoints.read();
                        endpoints
                            .iter()
                            .find(|ep| {
                                ep.is_network_endpoint() == (call.connection_count() > 0)
                            })
                            .cloned()
                    };
                    if let Some(endpoint) = candidate {
                        let party = format!("{}:{}", endpoint.core().prefix(), b_party);
                        return self.try_destination(call, &party, options).await;
                    }
                }
                return false;
            };

            // Skip routes that already failed
            if !routes_tried.insert(route.clone()) {
                continue;
            }

            if self.try_destination(call, &route, options).await {
                return true;
            }

            // Originating connection died while we were routing
            if call
                .get_connection(0)
                .map(|c| c.is_releasing())
                .unwrap_or(true)
            {
                return false;
            }

            // The route produced another symbolic party; recurse on it
            if Box::pin(self.on_route_connection(routes_tried, a_party, &route, call, options))
                .await
            {
                return true;
            }
        }
    }

    async fn try_destination(
        self: &Arc<Self>,
        call: &Arc<Call>,
        party: &str,
        options: &StringOptions,
    ) -> bool {
        match self.make_connection(call, party, false, options).await {
            Ok(connection) => match Box::pin(connection.set_up()).await {
                Ok(()) => true,
                Err(e) => {
                    debug!("Destination \"{}\" set-up failed: {}", party, e);
                    connection.release(CallEndReason::ConnectFail, false).await;
                    false
                }
            },
            Err(e) => {
                debug!("Destination \"{}\" rejected: {}", party, e);
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // Call lookup and clearing
    // ------------------------------------------------------------------

    /// An active call by token
    pub fn find_call(&self, token: &str) -> Option<Arc<Call>> {
        self.active_calls.get(token).map(|entry| entry.clone())
    }

    /// Number of active calls
    pub fn active_call_count(&self) -> usize {
        self.active_calls.len()
    }

    /// Whether the call exists and is fully established
    pub fn is_call_established(&self, token: &str) -> bool {
        self.find_call(token).map(|call| call.is_established()).unwrap_or(false)
    }

    /// Clear one call; the garbage collector reclaims it
    pub async fn clear_call(&self, token: &str, reason: CallEndReason) -> bool {
        match self.find_call(token) {
            Some(call) => {
                call.clear(reason).await;
                true
            }
            None => {
                debug!("Could not find call token \"{}\"", token);
                false
            }
        }
    }

    /// Clear one call and wait for the teardown to finish
    pub async fn clear_call_sync(&self, token: &str, reason: CallEndReason) -> bool {
        match self.find_call(token) {
            Some(call) => {
                call.clear_sync(reason).await;
                true
            }
            None => false,
        }
    }

    /// Clear every active call.
    ///
    /// Re-entrant: concurrent callers are counted, only the first
    /// actually walks the call list, and all waiters serialize until the
    /// last call is reclaimed. While any caller is inside, new calls are
    /// refused.
    pub async fn clear_all_calls(self: &Arc<Self>, reason: CallEndReason, wait: bool) {
        let first = self.clearing_all_count.fetch_add(1, Ordering::SeqCst) == 0;
        info!(
            "Clearing all calls {} ({} thread)",
            if wait { "and waiting" } else { "asynchronously" },
            if first { "primary" } else { "secondary" }
        );

        if first {
            let calls: Vec<Arc<Call>> =
                self.active_calls.iter().map(|entry| entry.clone()).collect();
            for call in calls {
                call.clear(reason).await;
            }
        }

        if wait {
            // One waiter at a time; later threads queue on the mutex until
            // the primary has seen the all-cleared signal
            let _guard = self.clearing_all_mutex.lock().await;
            while !self.active_calls.is_empty() {
                let _ = tokio::time::timeout(
                    Duration::from_millis(200),
                    self.all_calls_cleared.notified(),
                )
                .await;
            }
        }

        self.clearing_all_count.fetch_sub(1, Ordering::SeqCst);
        info!("All calls cleared");
    }

    // ------------------------------------------------------------------
    // Conferencing
    // ------------------------------------------------------------------

    /// Pull a call into a conference: the call's remote party becomes the
    /// conference URI and a mixer connection joins the call. The mixer
    /// node is created on demand; later members join the same node.
    pub async fn set_up_conference(
        self: &Arc<Self>,
        call_token: &str,
        conference_party: &str,
    ) -> Result<()> {
        let call = self
            .find_call(call_token)
            .ok_or_else(|| Error::UnknownToken(call_token.to_string()))?;
        call.set_party_b(conference_party);

        let connection = self
            .make_connection(&call, conference_party, false, &StringOptions::new())
            .await?;
        connection.set_up().await
    }

    // ------------------------------------------------------------------
    // Garbage collection
    // ------------------------------------------------------------------

    fn ensure_garbage_collector(self: &Arc<Self>) {
        let mut slot = self.garbage_collector.lock();
        if slot.is_some() {
            return;
        }
        let weak = Arc::downgrade(self);
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(GARBAGE_COLLECT_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else { break };
                manager.collect_garbage();
                manager.enforce_no_media_timeout().await;
            }
            debug!("Garbage collector stopped");
        }));
        debug!("Garbage collector started");
    }

    /// One collection pass: reclaim cleared calls, reap released
    /// connections, signal the all-cleared event
    pub fn collect_garbage(&self) {
        let mut reclaim = Vec::new();
        for entry in self.active_calls.iter() {
            let call = entry.value();
            let never_populated = call.connections().is_empty();
            if call.is_cleared()
                && (!never_populated || call.start_time().elapsed() > EMPTY_CALL_GRACE)
            {
                reclaim.push(entry.key().clone());
            }
        }

        for token in reclaim {
            if let Some((_, call)) = self.active_calls.remove(&token) {
                info!(
                    "Reclaimed call {} from \"{}\" to \"{}\" ({})",
                    token,
                    call.party_a(),
                    call.party_b(),
                    call.end_reason()
                        .map(|r| r.to_string())
                        .unwrap_or_else(|| "no reason".to_string())
                );
                self.each_observer(|o| o.on_cleared_call(&call));
                call.finalize_cleared();
            }
        }

        for endpoint in self.endpoints.read().iter() {
            endpoint.core().reap_released();
        }

        if self.clearing_all_count.load(Ordering::SeqCst) != 0 && self.active_calls.is_empty() {
            self.all_calls_cleared.notify_waiters();
        }
    }

    /// Clear established calls whose RTP has been silent past the
    /// configured no-media timeout
    async fn enforce_no_media_timeout(self: &Arc<Self>) {
        let timeout = self.config.no_media_timeout;
        if timeout.is_zero() {
            return;
        }

        // Snapshot first: the per-session checks await and must not hold
        // dictionary guards
        let calls: Vec<Arc<Call>> = self.active_calls.iter().map(|entry| entry.clone()).collect();

        let mut stale_calls = Vec::new();
        for call in calls {
            if !call.is_established() || call.is_cleared() {
                continue;
            }
            let established_for = call
                .established_time()
                .map(|at| at.elapsed())
                .unwrap_or_default();

            let mut has_media_sessions = false;
            let mut all_stale = true;
            for connection in call.connections() {
                for session in connection.rtp_sessions().await {
                    has_media_sessions = true;
                    let quiet = match session.time_since_last_received() {
                        Some(age) => age > timeout,
                        // Never received anything: stale once the call has
                        // been up longer than the timeout
                        None => established_for > timeout,
                    };
                    if !quiet {
                        all_stale = false;
                    }
                }
            }
            if has_media_sessions && all_stale {
                stale_calls.push(call);
            }
        }

        for call in stale_calls {
            warn!("Call {} cleared: no media past timeout", call.token());
            call.clear(CallEndReason::MediaFailed).await;
        }
    }
}

fn whoami() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "tandem".to_string())
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("endpoints", &self.endpoints.read().len())
            .field("active_calls", &self.active_calls.len())
            .field("routes", &self.route_table.lock().len())
            .finish()
    }
}
