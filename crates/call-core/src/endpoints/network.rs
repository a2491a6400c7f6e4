//! Network endpoint
//!
//! Generic endpoint for signalling families whose wire grammar lives
//! outside the core (H.323, SIP). It owns the RTP sessions carrying the
//! media legs and is driven by decoded signalling events: inbound calls
//! enter through `new_incoming_call`, outbound legs progress through a
//! configurable answer simulation until a real protocol engine is wired
//! on top.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use tandem_media_core::format::registry::standard_formats;
use tandem_media_core::format::{MediaFormat, MediaType};
use tandem_media_core::stream::{MediaStream, RtpMediaStream};
use tandem_media_core::OrderedFormatList;
use tandem_rtp_core::session::{RtpSession, RtpSessionConfig};

use crate::call::Call;
use crate::connection::Connection;
use crate::endpoint::{Endpoint, EndpointCore};
use crate::error::Result;
use crate::manager::Manager;
use crate::options::StringOptions;

/// Behaviour knobs for the network endpoint
#[derive(Debug, Clone)]
pub struct NetworkEndpointConfig {
    /// Outbound legs: how long until the far end starts ringing
    pub alerting_delay: Duration,

    /// Outbound legs: answer after ringing this long
    pub answer_delay: Duration,

    /// Outbound legs: whether the simulated far end answers at all
    pub auto_answer: bool,

    /// Restrict advertised formats to these names; `None` advertises the
    /// full standard set
    pub format_names: Option<Vec<String>>,

    /// Let the remote RTP transmit address float (symmetric RTP learning)
    pub allow_remote_media_address_change: bool,

    /// Tear the media session down on RTCP BYE
    pub close_media_on_bye: bool,
}

impl Default for NetworkEndpointConfig {
    fn default() -> Self {
        Self {
            alerting_delay: Duration::ZERO,
            answer_delay: Duration::ZERO,
            auto_answer: true,
            format_names: None,
            allow_remote_media_address_change: false,
            close_media_on_bye: false,
        }
    }
}

/// Endpoint family carrying media over RTP sessions
pub struct NetworkEndpoint {
    core: EndpointCore,
    config: RwLock<NetworkEndpointConfig>,
}

impl NetworkEndpoint {
    /// Create and register under a scheme prefix ("h323", "sip", ...)
    pub fn new(manager: &Arc<Manager>, prefix: &str) -> Arc<Self> {
        Self::with_config(manager, prefix, NetworkEndpointConfig::default())
    }

    /// Create with explicit behaviour
    pub fn with_config(
        manager: &Arc<Manager>,
        prefix: &str,
        config: NetworkEndpointConfig,
    ) -> Arc<Self> {
        let endpoint = Arc::new(Self {
            core: EndpointCore::new(manager, prefix),
            config: RwLock::new(config),
        });
        manager.attach_endpoint(endpoint.clone());
        endpoint
    }

    /// Change behaviour
    pub fn set_config(&self, config: NetworkEndpointConfig) {
        *self.config.write() = config;
    }

    /// Decoded signalling delivered an inbound call: build the
    /// originating connection and run it (routing included).
    ///
    /// `from` is the remote party as signalled, `to` the destination the
    /// protocol carried.
    pub async fn new_incoming_call(
        self: &Arc<Self>,
        from: &str,
        to: &str,
        options: &StringOptions,
    ) -> Result<Arc<Call>> {
        let manager = self.core.manager();
        let call = manager.new_incoming_call_container()?;
        call.set_party_a(from);

        let connection = self
            .clone()
            .make_connection(&call, from, true, options)
            .await?;
        connection.set_destination_address(to);
        connection.set_up().await?;
        Ok(call)
    }

    /// Signalling events for an existing connection, injected by the
    /// protocol engine above the core
    pub async fn inject_alerting(&self, token: &str, with_media: bool) -> bool {
        match self.core.find_connection(token) {
            Some(connection) => {
                connection.on_alerting(with_media).await;
                true
            }
            None => false,
        }
    }

    /// Remote answered
    pub async fn inject_connect(&self, token: &str) -> bool {
        match self.core.find_connection(token) {
            Some(connection) => {
                connection.on_connected().await;
                true
            }
            None => false,
        }
    }

    /// Remote cleared with a Q.931 cause
    pub async fn inject_release(&self, token: &str, cause: Option<u8>) -> bool {
        match self.core.find_connection(token) {
            Some(connection) => {
                let reason = match cause {
                    Some(cause) => crate::error::CallEndReason::Q931Cause(cause),
                    None => crate::error::CallEndReason::RemoteUser,
                };
                connection.release(reason, false).await;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl Endpoint for NetworkEndpoint {
    fn core(&self) -> &EndpointCore {
        &self.core
    }

    fn is_network_endpoint(&self) -> bool {
        true
    }

    fn media_formats(&self) -> OrderedFormatList {
        let all = standard_formats();
        match &self.config.read().format_names {
            Some(names) => OrderedFormatList::from_formats(
                all.into_iter().filter(|f| names.iter().any(|n| n == f.name())),
            ),
            None => OrderedFormatList::from_formats(all),
        }
    }

    async fn make_connection(
        self: Arc<Self>,
        call: &Arc<Call>,
        party: &str,
        originating: bool,
        options: &StringOptions,
    ) -> Result<Arc<Connection>> {
        let token = call.manager().next_connection_token();
        let connection =
            Connection::new(call, self.clone(), token, party, originating, options);
        self.core.register_connection(&connection);
        call.add_connection(connection.clone());
        Ok(connection)
    }

    async fn on_set_up_connection(&self, connection: &Arc<Connection>) -> Result<()> {
        if connection.is_originating() {
            // Inbound leg: the far end already sent setup; progress comes
            // from further injected signalling and the peer connection
            return Ok(());
        }

        // Outbound leg: simulated far end progress until a protocol
        // engine replaces it
        let config = self.config.read().clone();
        connection.on_proceeding();

        if !config.alerting_delay.is_zero() {
            tokio::time::sleep(config.alerting_delay).await;
        }
        connection.on_alerting(false).await;

        if config.auto_answer {
            if !config.answer_delay.is_zero() {
                tokio::time::sleep(config.answer_delay).await;
            }
            connection.on_connected().await;
        }
        Ok(())
    }

    async fn create_media_stream(
        &self,
        connection: &Arc<Connection>,
        format: &MediaFormat,
        session_id: u32,
        is_source: bool,
    ) -> Result<Arc<dyn MediaStream>> {
        let manager = self.core.manager();

        // One RTP session per media channel, created with the first
        // stream on it and shared by the return direction
        let session = match connection.rtp_session(session_id).await {
            Some(session) => session,
            None => {
                let config = self.config.read().clone();
                let session_config = RtpSessionConfig {
                    local_address: manager.rtp_bind_address(),
                    clock_rate: format.clock_rate(),
                    audio: format.media_type() == MediaType::Audio,
                    tool_name: manager.product_info().name,
                    allow_remote_address_change: config.allow_remote_media_address_change,
                    close_on_bye: config.close_media_on_bye,
                    ..Default::default()
                };
                let nat = manager.nat_methods();
                let session = RtpSession::bind(
                    session_config,
                    Some(manager.rtp_port_range()),
                    Some(&nat),
                )
                .await?;
                let dscp = manager.dscp_for(format.media_type());
                if let Err(e) = session.set_dscp(dscp) {
                    debug!("Could not set DSCP {} on media socket: {}", dscp, e);
                }
                debug!(
                    "Endpoint \"{}\" created RTP session {} for {} (dscp {})",
                    self.core.prefix(),
                    session_id,
                    connection.token(),
                    dscp
                );
                connection.set_rtp_session(session_id, session.clone()).await;
                session
            }
        };

        let jitter = if is_source {
            connection.jitter_settings().to_config(format.clock_rate())
        } else {
            None
        };
        let stream = Arc::new(RtpMediaStream::new(
            session,
            format.clone(),
            session_id,
            is_source,
            jitter,
        ));
        manager.notify_media_stream_opened(connection, session_id, is_source);
        Ok(stream)
    }
}
