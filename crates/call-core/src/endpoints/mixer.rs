//! Mixer (conference) endpoint
//!
//! Registered under "mcu". A party of the form `mcu:<node>` joins the
//! named conference node, creating it on demand. Each member's media
//! into the node is fanned out to every other member; sample level
//! summation belongs to codec plugins and is outside the core, so the
//! node bridges frames rather than mixing waveforms.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, trace};

use tandem_media_core::format::registry::standard_formats;
use tandem_media_core::format::MediaFormat;
use tandem_media_core::stream::{ChannelMediaStream, MediaStream};
use tandem_media_core::OrderedFormatList;
use tandem_rtp_core::packet::RtpPacket;

use crate::call::Call;
use crate::connection::Connection;
use crate::endpoint::{Endpoint, EndpointCore};
use crate::error::Result;
use crate::manager::Manager;
use crate::options::StringOptions;
use crate::routing::split_scheme;

struct MixerMember {
    token: String,
    to_member: mpsc::Sender<RtpPacket>,
}

/// One conference node; members hear every other member
pub struct MixerNode {
    name: String,
    members: RwLock<Vec<MixerMember>>,
}

impl MixerNode {
    fn new(name: &str) -> Arc<Self> {
        info!("Created conference node \"{}\"", name);
        Arc::new(Self { name: name.to_string(), members: RwLock::new(Vec::new()) })
    }

    /// Node name (the part after `mcu:`)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of joined members
    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    async fn add_member(&self, token: &str, to_member: mpsc::Sender<RtpPacket>) {
        self.members
            .write()
            .await
            .push(MixerMember { token: token.to_string(), to_member });
        debug!("Member {} joined conference \"{}\"", token, self.name);
    }

    async fn remove_member(&self, token: &str) {
        let mut members = self.members.write().await;
        members.retain(|member| member.token != token);
        debug!("Member {} left conference \"{}\"", token, self.name);
    }

    /// Deliver one member's frame to every other member
    async fn broadcast(&self, from_token: &str, packet: RtpPacket) {
        let members = self.members.read().await;
        for member in members.iter() {
            if member.token == from_token {
                continue;
            }
            // A slow member drops frames rather than stalling the node
            if member.to_member.try_send(packet.clone()).is_err() {
                trace!(
                    "Conference \"{}\" dropped frame for slow member {}",
                    self.name,
                    member.token
                );
            }
        }
    }
}

/// Endpoint hosting conference nodes
pub struct MixerEndpoint {
    core: EndpointCore,
    nodes: DashMap<String, Arc<MixerNode>>,
    memberships: DashMap<String, String>,
}

impl MixerEndpoint {
    /// Create and register under the "mcu" prefix
    pub fn new(manager: &Arc<Manager>) -> Arc<Self> {
        let endpoint = Arc::new(Self {
            core: EndpointCore::new(manager, "mcu"),
            nodes: DashMap::new(),
            memberships: DashMap::new(),
        });
        manager.attach_endpoint(endpoint.clone());
        endpoint
    }

    /// The node for a name, created on demand
    pub fn node(&self, name: &str) -> Arc<MixerNode> {
        self.nodes
            .entry(name.to_string())
            .or_insert_with(|| MixerNode::new(name))
            .clone()
    }

    /// An existing node, if any
    pub fn find_node(&self, name: &str) -> Option<Arc<MixerNode>> {
        self.nodes.get(name).map(|entry| entry.clone())
    }

    /// Number of conference nodes
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    fn node_for_connection(&self, connection: &Arc<Connection>) -> Arc<MixerNode> {
        let name = self
            .memberships
            .get(connection.token())
            .map(|entry| entry.clone())
            .unwrap_or_else(|| "default".to_string());
        self.node(&name)
    }
}

#[async_trait]
impl Endpoint for MixerEndpoint {
    fn core(&self) -> &EndpointCore {
        &self.core
    }

    fn is_network_endpoint(&self) -> bool {
        false
    }

    fn media_formats(&self) -> OrderedFormatList {
        OrderedFormatList::from_formats(standard_formats())
    }

    async fn make_connection(
        self: Arc<Self>,
        call: &Arc<Call>,
        party: &str,
        originating: bool,
        options: &StringOptions,
    ) -> Result<Arc<Connection>> {
        // mcu:conf42 names the node; a bare "mcu:" joins "default"
        let node_name = split_scheme(party)
            .map(|(_, rest)| rest)
            .filter(|rest| !rest.is_empty())
            .unwrap_or("default");
        self.node(node_name);

        let token = call.manager().next_connection_token();
        let connection =
            Connection::new(call, self.clone(), token, party, originating, options);
        self.memberships
            .insert(connection.token().to_string(), node_name.to_string());
        self.core.register_connection(&connection);
        call.add_connection(connection.clone());
        Ok(connection)
    }

    async fn on_set_up_connection(&self, connection: &Arc<Connection>) -> Result<()> {
        // The conference answers immediately
        connection.on_proceeding();
        connection.on_connected().await;
        Ok(())
    }

    async fn create_media_stream(
        &self,
        connection: &Arc<Connection>,
        format: &MediaFormat,
        session_id: u32,
        is_source: bool,
    ) -> Result<Arc<dyn MediaStream>> {
        let node = self.node_for_connection(connection);
        let token = connection.token().to_string();

        let stream: Arc<dyn MediaStream> = if is_source {
            // Media out of the node towards this member
            let (stream, to_member) = ChannelMediaStream::source(format.clone(), session_id, 32);
            node.add_member(&token, to_member).await;
            stream
        } else {
            // Media from this member into the node, fanned to the rest
            let (stream, mut from_member) =
                ChannelMediaStream::sink(format.clone(), session_id, 32);
            let node = node.clone();
            tokio::spawn(async move {
                while let Some(packet) = from_member.recv().await {
                    node.broadcast(&token, packet).await;
                }
            });
            stream
        };

        self.core
            .manager()
            .notify_media_stream_opened(connection, session_id, is_source);
        Ok(stream)
    }

    async fn on_connection_released(&self, connection: &Arc<Connection>) {
        if let Some((_, node_name)) = self.memberships.remove(connection.token()) {
            if let Some(node) = self.find_node(&node_name) {
                node.remove_member(connection.token()).await;
            }
        }
    }
}
