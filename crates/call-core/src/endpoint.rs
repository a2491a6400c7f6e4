//! Endpoint abstraction
//!
//! One endpoint exists per protocol family, registered with the manager
//! under one or more scheme prefixes ("h323", "sip", "pc", "mcu", ...).
//! It parses outbound party strings into originating connections, accepts
//! inbound signalling into terminating connections, supplies the media
//! formats its family can carry, and owns protocol-wide defaults.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use tandem_media_core::format::MediaFormat;
use tandem_media_core::stream::MediaStream;
use tandem_media_core::OrderedFormatList;

use crate::call::Call;
use crate::connection::Connection;
use crate::error::Result;
use crate::manager::Manager;
use crate::options::StringOptions;

/// Identity advertised by an endpoint in signalling
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ProductInfo {
    /// Vendor name
    pub vendor: String,
    /// Product name
    pub name: String,
    /// Product version
    pub version: String,
}

/// Protocol family factory for connections
#[async_trait]
pub trait Endpoint: Send + Sync {
    /// Shared bookkeeping every endpoint carries
    fn core(&self) -> &EndpointCore;

    /// True for endpoints that terminate on the network rather than on
    /// local hardware or software
    fn is_network_endpoint(&self) -> bool;

    /// Formats this protocol family (and its codec plugins) can carry
    fn media_formats(&self) -> OrderedFormatList;

    /// Build a connection towards (or from) `party` inside `call`.
    ///
    /// The connection is registered with both the call and the endpoint.
    async fn make_connection(
        self: Arc<Self>,
        call: &Arc<Call>,
        party: &str,
        originating: bool,
        options: &StringOptions,
    ) -> Result<Arc<Connection>>;

    /// Drive protocol specific set-up after the connection entered the
    /// `SetUp` phase (dialling for outbound legs, answering for inbound)
    async fn on_set_up_connection(&self, connection: &Arc<Connection>) -> Result<()>;

    /// Create one media stream for a connection of this family
    async fn create_media_stream(
        &self,
        connection: &Arc<Connection>,
        format: &MediaFormat,
        session_id: u32,
        is_source: bool,
    ) -> Result<Arc<dyn MediaStream>>;

    /// Hook run when a connection of this endpoint is fully released
    async fn on_connection_released(&self, _connection: &Arc<Connection>) {}
}

/// State common to every endpoint implementation
pub struct EndpointCore {
    manager: Weak<Manager>,
    prefix: String,
    connections: DashMap<String, Arc<Connection>>,
    /// Default local party name for connections of this family
    pub default_user_name: parking_lot::RwLock<String>,
    /// Default display name
    pub default_display_name: parking_lot::RwLock<String>,
    /// Identity advertised in signalling
    pub product_info: parking_lot::RwLock<ProductInfo>,
}

impl EndpointCore {
    /// Core for an endpoint registered under `prefix`
    pub fn new(manager: &Arc<Manager>, prefix: &str) -> Self {
        Self {
            manager: Arc::downgrade(manager),
            prefix: prefix.to_string(),
            connections: DashMap::new(),
            default_user_name: parking_lot::RwLock::new(manager.default_user_name()),
            default_display_name: parking_lot::RwLock::new(manager.default_display_name()),
            product_info: parking_lot::RwLock::new(manager.product_info()),
        }
    }

    /// The scheme prefix this endpoint answers to
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The owning manager; panics after manager teardown
    pub fn manager(&self) -> Arc<Manager> {
        self.manager.upgrade().expect("manager outlives endpoints")
    }

    /// Track a connection for the endpoint's lifetime bookkeeping
    pub fn register_connection(&self, connection: &Arc<Connection>) {
        self.connections.insert(connection.token().to_string(), connection.clone());
    }

    /// Find a live connection by token
    pub fn find_connection(&self, token: &str) -> Option<Arc<Connection>> {
        self.connections.get(token).map(|entry| entry.clone())
    }

    /// Number of connections currently tracked
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Drop released connections; run by the garbage collector.
    /// Returns how many were reaped.
    pub fn reap_released(&self) -> usize {
        let before = self.connections.len();
        self.connections.retain(|_, connection| !connection.is_released());
        let reaped = before - self.connections.len();
        if reaped > 0 {
            debug!("Endpoint \"{}\" reaped {} connections", self.prefix, reaped);
        }
        reaped
    }

    /// Iterate tokens of live connections
    pub fn connection_tokens(&self) -> Vec<String> {
        self.connections.iter().map(|entry| entry.key().clone()).collect()
    }
}
