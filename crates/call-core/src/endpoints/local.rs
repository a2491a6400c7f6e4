//! Local (soundcard / softphone) endpoint
//!
//! Registered under "pc". Media terminates in process: each stream is an
//! in-memory channel the application reads speaker frames from and writes
//! microphone frames into. Incoming calls alert and, by default, answer
//! automatically; applications wanting ring-until-answer turn
//! `auto_answer` off and call `answer` themselves.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::debug;

use tandem_media_core::format::registry::standard_formats;
use tandem_media_core::format::MediaFormat;
use tandem_media_core::stream::{ChannelMediaStream, MediaStream};
use tandem_media_core::OrderedFormatList;
use tandem_rtp_core::packet::RtpPacket;

use crate::call::Call;
use crate::connection::Connection;
use crate::endpoint::{Endpoint, EndpointCore};
use crate::error::{Error, Result};
use crate::manager::Manager;
use crate::options::StringOptions;

/// Behaviour knobs for the local endpoint
#[derive(Debug, Clone)]
pub struct LocalEndpointConfig {
    /// Answer incoming calls without application involvement
    pub auto_answer: bool,

    /// Simulated pick-up delay when auto answering
    pub answer_delay: Duration,
}

impl Default for LocalEndpointConfig {
    fn default() -> Self {
        Self { auto_answer: true, answer_delay: Duration::ZERO }
    }
}

#[derive(Default)]
struct MediaHandles {
    microphone: Option<mpsc::Sender<RtpPacket>>,
    speaker: Option<mpsc::Receiver<RtpPacket>>,
}

/// Endpoint terminating calls on local audio channels
pub struct LocalEndpoint {
    core: EndpointCore,
    config: RwLock<LocalEndpointConfig>,
    media: DashMap<(String, u32), Mutex<MediaHandles>>,
}

impl LocalEndpoint {
    /// Create and register under the "pc" prefix
    pub fn new(manager: &Arc<Manager>) -> Arc<Self> {
        Self::with_prefix(manager, "pc", LocalEndpointConfig::default())
    }

    /// Create under an arbitrary prefix ("pots", "ivr" style families
    /// share the local media model)
    pub fn with_prefix(
        manager: &Arc<Manager>,
        prefix: &str,
        config: LocalEndpointConfig,
    ) -> Arc<Self> {
        let endpoint = Arc::new(Self {
            core: EndpointCore::new(manager, prefix),
            config: RwLock::new(config),
            media: DashMap::new(),
        });
        manager.attach_endpoint(endpoint.clone());
        endpoint
    }

    /// Change the answering behaviour
    pub fn set_config(&self, config: LocalEndpointConfig) {
        *self.config.write() = config;
    }

    /// Answer a ringing connection (manual answer mode)
    pub async fn answer(&self, token: &str) -> Result<()> {
        let connection = self
            .core
            .find_connection(token)
            .ok_or_else(|| Error::UnknownToken(token.to_string()))?;
        connection.on_connected().await;
        Ok(())
    }

    /// The microphone feed for a connection's media session: frames sent
    /// here flow into the call
    pub fn microphone(&self, token: &str, session_id: u32) -> Option<mpsc::Sender<RtpPacket>> {
        self.media
            .get(&(token.to_string(), session_id))
            .and_then(|entry| entry.lock().microphone.clone())
    }

    /// Take the speaker output for a connection's media session: frames
    /// from the far side arrive here
    pub fn take_speaker(&self, token: &str, session_id: u32) -> Option<mpsc::Receiver<RtpPacket>> {
        self.media
            .get(&(token.to_string(), session_id))
            .and_then(|entry| entry.lock().speaker.take())
    }

    fn handles(&self, token: &str, session_id: u32) -> dashmap::mapref::one::Ref<'_, (String, u32), Mutex<MediaHandles>> {
        self.media
            .entry((token.to_string(), session_id))
            .or_default()
            .downgrade()
    }
}

#[async_trait]
impl Endpoint for LocalEndpoint {
    fn core(&self) -> &EndpointCore {
        &self.core
    }

    fn is_network_endpoint(&self) -> bool {
        false
    }

    fn media_formats(&self) -> OrderedFormatList {
        // Software termination passes any standard telephony format
        OrderedFormatList::from_formats(standard_formats())
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
            // Local user is dialling out; destination progress drives the
            // rest of the phases
            connection.on_proceeding();
            return Ok(());
        }

        // Incoming call towards the local user
        connection.on_alerting(false).await;
        let config = self.config.read().clone();
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
        let stream: Arc<dyn MediaStream> = if is_source {
            let (stream, microphone) =
                ChannelMediaStream::source(format.clone(), session_id, 32);
            self.handles(connection.token(), session_id).lock().microphone = Some(microphone);
            stream
        } else {
            let (stream, speaker) = ChannelMediaStream::sink(format.clone(), session_id, 32);
            self.handles(connection.token(), session_id).lock().speaker = Some(speaker);
            stream
        };

        debug!(
            "Local endpoint created {} stream for {} session {}",
            if is_source { "microphone" } else { "speaker" },
            connection.token(),
            session_id
        );
        self.core
            .manager()
            .notify_media_stream_opened(connection, session_id, is_source);
        Ok(stream)
    }

    async fn on_connection_released(&self, connection: &Arc<Connection>) {
        // Drop the media handles of the finished call
        self.media.retain(|(token, _), _| token != connection.token());
    }
}
