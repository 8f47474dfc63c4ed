//! Per-node protocol dispatcher.
//!
//! [`NodeCore`] owns everything one node knows: exported sources and models,
//! acquired replicas, the registry (hosted or replicated) and the set of open
//! channels. It performs no I/O. The transport feeds it channel events and
//! packets, then drains [`NodeCore::take_outgoing`] and
//! [`NodeCore::take_dials`] after every call.

use crate::config::NodeConfig;
use crate::descriptor::ApiDescriptor;
use crate::error::{RemoteObjectsError, Result};
use crate::model::{ItemModel, ModelExporter, ModelReplica};
use crate::packet::{CallOutcome, HandshakeStatus, Packet};
use crate::persist::PersistedStore;
use crate::registry::{RegistryHost, RegistryReplica, REGISTRY_NAME};
use crate::replica::{PendingCall, Replica, ReplicaState};
use crate::source::{SourceExporter, SourceObject};
use crate::types::{ChannelId, NodeId, SourceLocation, SourceLocations, Value};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Request for the transport to open a channel to `endpoint`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialRequest {
    pub endpoint: String,
    /// Delay before dialing; zero for an immediate attempt.
    pub after: Duration,
}

/// What a connected peer told us about itself.
#[derive(Debug, Default)]
struct Peer {
    /// Listening endpoint; known up front for dialed channels, otherwise
    /// from the peer's Hello.
    endpoint: Option<String>,
    node: Option<NodeId>,
    sources: BTreeSet<String>,
}

struct RegistryLink {
    replica: RegistryReplica,
    endpoint: String,
    channel: Option<ChannelId>,
}

enum Binding {
    Object(Replica),
    Model(ModelReplica),
}

impl Binding {
    fn state(&self) -> ReplicaState {
        match self {
            Binding::Object(replica) => replica.state(),
            Binding::Model(replica) => replica.state(),
        }
    }

    fn start_handshake(&mut self) {
        match self {
            Binding::Object(replica) => replica.start_handshake(),
            Binding::Model(replica) => replica.start_handshake(),
        }
    }

    fn handle_packet(&mut self, packet: Packet) {
        match self {
            Binding::Object(replica) => replica.handle_packet(packet),
            Binding::Model(replica) => replica.handle_packet(packet),
        }
    }

    fn channel_lost(&mut self) {
        match self {
            Binding::Object(replica) => replica.channel_lost(),
            Binding::Model(replica) => replica.channel_lost(),
        }
    }

    fn shutdown(&mut self) {
        match self {
            Binding::Object(replica) => replica.shutdown(),
            Binding::Model(replica) => replica.shutdown(),
        }
    }

    fn take_outgoing(&mut self) -> Vec<Packet> {
        match self {
            Binding::Object(replica) => replica.take_outgoing(),
            Binding::Model(replica) => replica.take_outgoing(),
        }
    }
}

struct ReplicaSlot {
    binding: Binding,
    /// Channel the binding is handshaking or bound on.
    channel: Option<ChannelId>,
}

/// Single-owner protocol state of one node.
pub struct NodeCore {
    id: NodeId,

    /// Endpoint peers dial to reach this node; also the location this node
    /// registers its sources under.
    endpoint: String,

    config: NodeConfig,

    store: Option<Arc<dyn PersistedStore>>,

    sources: BTreeMap<String, SourceExporter>,
    models: BTreeMap<String, ModelExporter>,

    registry_host: Option<RegistryHost>,
    registry: Option<RegistryLink>,

    replicas: BTreeMap<String, ReplicaSlot>,

    peers: BTreeMap<ChannelId, Peer>,

    /// Endpoints with a dial in progress.
    dialing: HashSet<String>,
    dials: Vec<DialRequest>,

    outbox: Vec<(ChannelId, Packet)>,
}

impl NodeCore {
    pub fn new(endpoint: impl Into<String>, config: NodeConfig) -> Result<Self> {
        config.validate()?;
        Ok(NodeCore {
            id: NodeId::new(),
            endpoint: endpoint.into(),
            config,
            store: None,
            sources: BTreeMap::new(),
            models: BTreeMap::new(),
            registry_host: None,
            registry: None,
            replicas: BTreeMap::new(),
            peers: BTreeMap::new(),
            dialing: HashSet::new(),
            dials: Vec::new(),
            outbox: Vec::new(),
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Store used to seed and save persisted properties of new replicas.
    pub fn set_store(&mut self, store: Arc<dyn PersistedStore>) {
        self.store = Some(store);
    }

    // ---- registry --------------------------------------------------------

    /// Makes this node the registry host. Already exported sources are
    /// registered immediately.
    pub fn host_registry(&mut self) -> Result<()> {
        if self.registry.is_some() {
            return Err(RemoteObjectsError::Config(
                "node already uses a remote registry".to_string(),
            ));
        }
        if self.registry_host.is_some() {
            return Ok(());
        }
        let mut host = RegistryHost::new();
        for name in self.hosted_names() {
            let location = SourceLocation::new(name, self.endpoint.clone());
            if let Err(e) = host.add_source(location, None) {
                warn!(error = %e, "hosted source not registered");
            }
        }
        info!(endpoint = %self.endpoint, "hosting registry");
        self.registry_host = Some(host);
        Ok(())
    }

    /// Connects to the registry hosted at `endpoint`.
    pub fn attach_registry(&mut self, endpoint: impl Into<String>) -> Result<()> {
        if self.registry_host.is_some() {
            return Err(RemoteObjectsError::Config(
                "node hosts the registry itself".to_string(),
            ));
        }
        if self.registry.is_some() {
            return Err(RemoteObjectsError::Config(
                "node is already attached to a registry".to_string(),
            ));
        }
        let endpoint = endpoint.into();
        let mut replica = RegistryReplica::new();
        for name in self.hosted_names() {
            replica.add_source(SourceLocation::new(name, self.endpoint.clone()));
        }
        let channel = self.channel_to(&endpoint);
        self.registry = Some(RegistryLink {
            replica,
            endpoint: endpoint.clone(),
            channel: None,
        });
        match channel {
            Some(channel) => self.bind_registry(channel),
            None => self.request_dial(endpoint, Duration::ZERO),
        }
        Ok(())
    }

    fn bind_registry(&mut self, channel: ChannelId) {
        if let Some(link) = self.registry.as_mut() {
            if link.channel.is_none() {
                debug!(%channel, endpoint = %link.endpoint, "binding registry");
                link.channel = Some(channel);
                link.replica.start_handshake();
            }
        }
    }

    /// Registry contents as currently known by this node.
    pub fn source_locations(&self) -> SourceLocations {
        match (&self.registry_host, &self.registry) {
            (Some(host), _) => host.source_locations().clone(),
            (None, Some(link)) => link.replica.source_locations().clone(),
            (None, None) => SourceLocations::new(),
        }
    }

    pub fn registry_state(&self) -> Option<ReplicaState> {
        if self.registry_host.is_some() {
            return Some(ReplicaState::Valid);
        }
        self.registry.as_ref().map(|link| link.replica.state())
    }

    pub fn registry_replica(&self) -> Option<&RegistryReplica> {
        self.registry.as_ref().map(|link| &link.replica)
    }

    fn registered_location(&self, name: &str) -> Option<SourceLocation> {
        match (&self.registry_host, &self.registry) {
            (Some(host), _) => host.source_locations().get(name).cloned(),
            (None, Some(link)) => link.replica.source_locations().get(name).cloned(),
            (None, None) => None,
        }
    }

    fn register(&mut self, name: &str) {
        let location = SourceLocation::new(name, self.endpoint.clone());
        if let Some(host) = self.registry_host.as_mut() {
            // Rejections are logged by the host; the source stays exported.
            let _ = host.add_source(location, None);
        } else if let Some(link) = self.registry.as_mut() {
            link.replica.add_source(location);
        }
    }

    fn unregister(&mut self, name: &str) {
        let location = SourceLocation::new(name, self.endpoint.clone());
        if let Some(host) = self.registry_host.as_mut() {
            host.remove_source(&location);
        } else if let Some(link) = self.registry.as_mut() {
            link.replica.remove_source(&location);
        }
    }

    // ---- exporting -------------------------------------------------------

    pub fn hosted_names(&self) -> Vec<String> {
        self.sources
            .keys()
            .chain(self.models.keys())
            .cloned()
            .collect()
    }

    fn check_free_name(&self, name: &str) -> Result<()> {
        if name == REGISTRY_NAME || self.sources.contains_key(name) || self.models.contains_key(name) {
            warn!(name, "name already exported by this node");
            return Err(RemoteObjectsError::DuplicateName {
                name: name.to_string(),
                existing: self.endpoint.clone(),
                rejected: self.endpoint.clone(),
            });
        }
        if self.replicas.contains_key(name) {
            return Err(RemoteObjectsError::Config(format!(
                "{name} is acquired as a replica on this node"
            )));
        }
        Ok(())
    }

    /// Exports `object` under `name` and registers it.
    pub fn enable_remoting(&mut self, name: impl Into<String>, object: Box<dyn SourceObject>) -> Result<()> {
        let name = name.into();
        self.check_free_name(&name)?;
        info!(source = %name, type_name = %object.descriptor().type_name(), "exporting source");
        self.sources.insert(name.clone(), SourceExporter::new(name.clone(), object));
        self.register(&name);
        self.announce();
        Ok(())
    }

    pub fn enable_model_remoting(&mut self, name: impl Into<String>, model: Box<dyn ItemModel>) -> Result<()> {
        let name = name.into();
        self.check_free_name(&name)?;
        info!(model = %name, "exporting model");
        let exporter = ModelExporter::new(name.clone(), model, self.config.model.max_pushed_cells);
        self.models.insert(name.clone(), exporter);
        self.register(&name);
        self.announce();
        Ok(())
    }

    /// Stops exporting `name`. Bound replicas are told the source is gone.
    pub fn disable_remoting(&mut self, name: &str) -> bool {
        let channels: Vec<ChannelId> = if let Some(mut source) = self.sources.remove(name) {
            self.outbox.extend(source.take_outgoing());
            source.bound_channels().collect()
        } else if let Some(mut model) = self.models.remove(name) {
            self.outbox.extend(model.take_outgoing());
            model.bound_channels().collect()
        } else {
            return false;
        };
        for channel in channels {
            self.outbox.push((
                channel,
                Packet::HandshakeAck {
                    name: name.to_string(),
                    status: HandshakeStatus::NoSuchSource,
                },
            ));
        }
        info!(source = %name, "source no longer exported");
        self.unregister(name);
        self.announce();
        true
    }

    pub fn source(&self, name: &str) -> Option<&SourceExporter> {
        self.sources.get(name)
    }

    pub fn source_mut(&mut self, name: &str) -> Option<&mut SourceExporter> {
        self.sources.get_mut(name)
    }

    pub fn model_exporter(&self, name: &str) -> Option<&ModelExporter> {
        self.models.get(name)
    }

    pub fn model_exporter_mut(&mut self, name: &str) -> Option<&mut ModelExporter> {
        self.models.get_mut(name)
    }

    fn announce(&mut self) {
        let sources = self.hosted_names();
        let channels: Vec<ChannelId> = self.peers.keys().copied().collect();
        for channel in channels {
            self.outbox.push((
                channel,
                Packet::Hello {
                    node: self.id,
                    endpoint: self.endpoint.clone(),
                    sources: sources.clone(),
                },
            ));
        }
    }

    // ---- replicas --------------------------------------------------------

    /// Creates a replica of the source `name`. Returns `false` if one already
    /// exists.
    pub fn acquire(&mut self, name: impl Into<String>, descriptor: Arc<ApiDescriptor>) -> Result<bool> {
        let name = name.into();
        if self.replicas.contains_key(&name) {
            return Ok(false);
        }
        self.check_local(&name)?;
        let mut replica = Replica::new(name.clone(), descriptor);
        if let Some(store) = &self.store {
            replica = replica.with_store(Arc::clone(store));
        }
        self.insert_slot(name, Binding::Object(replica));
        Ok(true)
    }

    /// Creates a model replica of `name` using the node's cache settings.
    pub fn acquire_model(&mut self, name: impl Into<String>) -> Result<bool> {
        let name = name.into();
        if self.replicas.contains_key(&name) {
            return Ok(false);
        }
        self.check_local(&name)?;
        let config = self.config.model.clone().with_env_overrides();
        self.insert_slot(name.clone(), Binding::Model(ModelReplica::new(name, config)));
        Ok(true)
    }

    fn check_local(&self, name: &str) -> Result<()> {
        if name == REGISTRY_NAME || self.sources.contains_key(name) || self.models.contains_key(name) {
            return Err(RemoteObjectsError::Config(format!(
                "{name} is exported by this node; same-node replicas are not supported"
            )));
        }
        Ok(())
    }

    fn insert_slot(&mut self, name: String, binding: Binding) {
        debug!(replica = %name, "replica acquired");
        self.replicas.insert(
            name.clone(),
            ReplicaSlot {
                binding,
                channel: None,
            },
        );
        self.try_bind(&name);
    }

    /// Destroys the replica, cancelling its pending calls and fetches.
    pub fn release(&mut self, name: &str) -> bool {
        let Some(mut slot) = self.replicas.remove(name) else {
            return false;
        };
        slot.binding.shutdown();
        let packets = slot.binding.take_outgoing();
        if let Some(channel) = slot.channel {
            self.outbox.extend(packets.into_iter().map(|p| (channel, p)));
        }
        debug!(replica = %name, "replica released");
        true
    }

    /// Releases every replica; used when the node shuts down.
    pub fn release_all(&mut self) {
        let names: Vec<String> = self.replicas.keys().cloned().collect();
        for name in names {
            self.release(&name);
        }
    }

    pub fn replica(&self, name: &str) -> Option<&Replica> {
        match &self.replicas.get(name)?.binding {
            Binding::Object(replica) => Some(replica),
            Binding::Model(_) => None,
        }
    }

    pub fn replica_mut(&mut self, name: &str) -> Option<&mut Replica> {
        match &mut self.replicas.get_mut(name)?.binding {
            Binding::Object(replica) => Some(replica),
            Binding::Model(_) => None,
        }
    }

    pub fn model_replica(&self, name: &str) -> Option<&ModelReplica> {
        match &self.replicas.get(name)?.binding {
            Binding::Model(replica) => Some(replica),
            Binding::Object(_) => None,
        }
    }

    pub fn model_replica_mut(&mut self, name: &str) -> Option<&mut ModelReplica> {
        match &mut self.replicas.get_mut(name)?.binding {
            Binding::Model(replica) => Some(replica),
            Binding::Object(_) => None,
        }
    }

    pub fn replica_state(&self, name: &str) -> Option<ReplicaState> {
        self.replicas.get(name).map(|slot| slot.binding.state())
    }

    /// Requests a property write on the replica `name`.
    pub fn set_property(&mut self, name: &str, property: &str, value: impl Into<Value>) -> Result<()> {
        self.replica_mut(name)
            .ok_or_else(|| RemoteObjectsError::NoSuchSource(name.to_string()))?
            .set_property_by_name(property, value)
    }

    /// Invokes a method on the replica `name`.
    pub fn call(&mut self, name: &str, method: &str, args: Vec<Value>) -> Result<Option<PendingCall>> {
        self.replica_mut(name)
            .ok_or_else(|| RemoteObjectsError::NoSuchSource(name.to_string()))?
            .call_by_name(method, args)
    }

    fn try_bind_all(&mut self) {
        let unbound: Vec<String> = self
            .replicas
            .iter()
            .filter(|(_, slot)| slot.channel.is_none())
            .map(|(name, _)| name.clone())
            .collect();
        for name in unbound {
            self.try_bind(&name);
        }
    }

    /// Binds an unbound replica over a channel to the endpoint the registry
    /// lists for it, dialing when none is open. Without a registry entry any
    /// peer advertising the name is used.
    fn try_bind(&mut self, name: &str) {
        match self.replicas.get(name) {
            Some(slot) if slot.channel.is_none() => {
                if slot.binding.state() == ReplicaState::SignatureMismatch {
                    return;
                }
            }
            _ => return,
        }

        let target = match self.registered_location(name) {
            Some(location) if location.endpoint == self.endpoint => return,
            Some(location) => Some(location.endpoint),
            None => None,
        };
        let channel = match &target {
            Some(endpoint) => self.channel_to(endpoint),
            None => self
                .peers
                .iter()
                .find(|(_, peer)| peer.sources.contains(name))
                .map(|(channel, _)| *channel),
        };
        let Some(channel) = channel else {
            if let Some(endpoint) = target {
                self.request_dial(endpoint, Duration::ZERO);
            }
            return;
        };

        if let Some(slot) = self.replicas.get_mut(name) {
            debug!(replica = %name, %channel, "binding replica");
            slot.channel = Some(channel);
            slot.binding.start_handshake();
        }
    }

    // ---- channels --------------------------------------------------------

    fn channel_to(&self, endpoint: &str) -> Option<ChannelId> {
        self.peers
            .iter()
            .find(|(_, peer)| peer.endpoint.as_deref() == Some(endpoint))
            .map(|(channel, _)| *channel)
    }

    fn request_dial(&mut self, endpoint: String, after: Duration) {
        if endpoint == self.endpoint || self.channel_to(&endpoint).is_some() {
            return;
        }
        if self.dialing.insert(endpoint.clone()) {
            debug!(%endpoint, ?after, "dial requested");
            self.dials.push(DialRequest { endpoint, after });
        }
    }

    /// Opens a channel to another node without going through the registry.
    /// Replicas bind to it once its Hello lists their source.
    pub fn connect_to_node(&mut self, endpoint: impl Into<String>) {
        self.request_dial(endpoint.into(), Duration::ZERO);
    }

    pub fn take_dials(&mut self) -> Vec<DialRequest> {
        std::mem::take(&mut self.dials)
    }

    /// A dial did not produce a channel. The registry endpoint, and any
    /// endpoint an unbound replica still resolves to, is retried after
    /// the reconnect interval.
    pub fn dial_failed(&mut self, endpoint: &str) {
        self.dialing.remove(endpoint);
        let wanted = self
            .registry
            .as_ref()
            .is_some_and(|link| link.endpoint == endpoint)
            || self.replicas.iter().any(|(name, slot)| {
                slot.channel.is_none()
                    && self
                        .registered_location(name)
                        .is_some_and(|location| location.endpoint == endpoint)
            });
        if wanted {
            warn!(%endpoint, "connection failed, retrying");
            self.request_dial(endpoint.to_string(), self.config.reconnect_interval());
        } else {
            debug!(%endpoint, "connection failed");
        }
    }

    /// Registers a freshly opened channel. `endpoint` is the peer's
    /// listening endpoint when this node dialed it, `None` for accepted
    /// channels.
    pub fn channel_opened(&mut self, channel: ChannelId, endpoint: Option<String>) {
        info!(%channel, endpoint = ?endpoint, "channel opened");
        self.peers.insert(
            channel,
            Peer {
                endpoint: endpoint.clone(),
                ..Peer::default()
            },
        );
        self.outbox.push((
            channel,
            Packet::Hello {
                node: self.id,
                endpoint: self.endpoint.clone(),
                sources: self.hosted_names(),
            },
        ));
        if let Some(endpoint) = endpoint {
            self.peer_endpoint_known(channel, &endpoint);
        }
        self.try_bind_all();
    }

    fn peer_endpoint_known(&mut self, channel: ChannelId, endpoint: &str) {
        self.dialing.remove(endpoint);
        let is_registry = self
            .registry
            .as_ref()
            .is_some_and(|link| link.endpoint == endpoint);
        if is_registry {
            self.bind_registry(channel);
        }
    }

    pub fn channel_closed(&mut self, channel: ChannelId) {
        let Some(peer) = self.peers.remove(&channel) else {
            return;
        };
        info!(%channel, endpoint = ?peer.endpoint, "channel closed");
        self.outbox.retain(|(c, _)| *c != channel);
        for source in self.sources.values_mut() {
            source.channel_closed(channel);
        }
        for model in self.models.values_mut() {
            model.channel_closed(channel);
        }
        if let Some(host) = self.registry_host.as_mut() {
            host.channel_closed(channel);
        }

        let mut redial = None;
        if let Some(link) = self.registry.as_mut() {
            if link.channel == Some(channel) {
                link.channel = None;
                link.replica.channel_lost();
                redial = Some(link.endpoint.clone());
            }
        }
        if let Some(endpoint) = redial {
            warn!(%endpoint, "registry connection lost");
            self.request_dial(endpoint, self.config.reconnect_interval());
        }

        for (name, slot) in self.replicas.iter_mut() {
            if slot.channel == Some(channel) {
                debug!(replica = %name, "replica lost its channel");
                slot.channel = None;
                slot.binding.channel_lost();
            }
        }
        self.try_bind_all();
    }

    /// Queues a keep-alive on every open channel.
    pub fn heartbeat(&mut self) {
        let channels: Vec<ChannelId> = self.peers.keys().copied().collect();
        for channel in channels {
            self.outbox.push((channel, Packet::HeartBeat));
        }
    }

    pub fn open_channels(&self) -> usize {
        self.peers.len()
    }

    pub fn handle_packet(&mut self, channel: ChannelId, packet: Packet) {
        let Some(peer) = self.peers.get_mut(&channel) else {
            warn!(%channel, "packet on unknown channel");
            return;
        };
        match packet {
            Packet::Hello {
                node,
                endpoint,
                sources,
            } => {
                debug!(%channel, %node, %endpoint, sources = sources.len(), "peer hello");
                peer.node = Some(node);
                peer.endpoint = Some(endpoint.clone());
                peer.sources = sources.into_iter().collect();
                self.peer_endpoint_known(channel, &endpoint);
                self.try_bind_all();
            }
            Packet::HeartBeat => self.outbox.push((channel, Packet::HeartBeatAck)),
            Packet::HeartBeatAck => trace!(%channel, "heartbeat acknowledged"),
            Packet::RegistryAdd { .. } | Packet::RegistryRemove { .. } => {
                self.handle_registry_packet(channel, packet)
            }
            Packet::Handshake {
                name,
                type_name,
                signature,
            } => self.handle_handshake(channel, name, &type_name, &signature),
            Packet::Invoke { .. }
            | Packet::Release { .. }
            | Packet::ModelFetchRequest { .. }
            | Packet::ModelSizeRequest { .. }
            | Packet::ModelSetData { .. } => self.route_to_source(channel, packet),
            other => self.route_to_replica(channel, other),
        }
    }

    fn handle_registry_packet(&mut self, channel: ChannelId, packet: Packet) {
        if let Some(host) = self.registry_host.as_mut() {
            match packet {
                Packet::RegistryAdd { location } => {
                    // Rejections are logged by the host.
                    let _ = host.add_source(location, Some(channel));
                }
                Packet::RegistryRemove { location } => {
                    host.remove_source(&location);
                }
                _ => {}
            }
            self.try_bind_all();
            return;
        }
        match self.registry.as_mut() {
            Some(link) if link.channel == Some(channel) => {
                link.replica.handle_packet(packet);
                self.try_bind_all();
            }
            _ => debug!(%channel, "registry packet from a channel that is not the registry"),
        }
    }

    fn handle_handshake(&mut self, channel: ChannelId, name: String, type_name: &str, signature: &str) {
        if name == REGISTRY_NAME {
            if let Some(host) = self.registry_host.as_mut() {
                host.handle_handshake(channel, signature);
                return;
            }
        } else if let Some(source) = self.sources.get_mut(&name) {
            source.handle_handshake(channel, type_name, signature);
            return;
        } else if let Some(model) = self.models.get_mut(&name) {
            model.handle_handshake(channel, signature);
            return;
        }
        debug!(%channel, source = %name, "handshake for a source this node does not export");
        self.outbox.push((
            channel,
            Packet::HandshakeAck {
                name,
                status: HandshakeStatus::NoSuchSource,
            },
        ));
    }

    fn route_to_source(&mut self, channel: ChannelId, packet: Packet) {
        let Some(name) = packet.binding_name().map(str::to_string) else {
            return;
        };
        if name == REGISTRY_NAME {
            if let (Some(host), Packet::Release { .. }) = (self.registry_host.as_mut(), &packet) {
                host.release(channel);
            }
            return;
        }
        if let Some(source) = self.sources.get_mut(&name) {
            source.handle_packet(channel, packet);
        } else if let Some(model) = self.models.get_mut(&name) {
            model.handle_packet(channel, packet);
        } else if let Packet::Invoke {
            call_id: Some(call_id),
            ..
        } = packet
        {
            self.outbox.push((
                channel,
                Packet::Reply {
                    name: name.clone(),
                    call_id,
                    outcome: CallOutcome::Err(format!("no source named {name}")),
                },
            ));
        } else {
            debug!(%channel, source = %name, "dropping request for unknown source");
        }
    }

    fn route_to_replica(&mut self, channel: ChannelId, packet: Packet) {
        let Some(name) = packet.binding_name().map(str::to_string) else {
            return;
        };
        if name == REGISTRY_NAME {
            self.handle_registry_packet(channel, packet);
            return;
        }
        let no_such_source = matches!(
            packet,
            Packet::HandshakeAck {
                status: HandshakeStatus::NoSuchSource,
                ..
            }
        );
        let Some(slot) = self.replicas.get_mut(&name) else {
            trace!(%channel, replica = %name, "packet for a released replica");
            return;
        };
        if slot.channel != Some(channel) {
            trace!(%channel, replica = %name, "packet from a channel the replica is not bound on");
            return;
        }
        slot.binding.handle_packet(packet);
        if matches!(
            slot.binding.state(),
            ReplicaState::Uninitialized | ReplicaState::SignatureMismatch
        ) {
            slot.channel = None;
        }
        if no_such_source {
            // Wait for the peer's next Hello or registry update.
            if let Some(peer) = self.peers.get_mut(&channel) {
                peer.sources.remove(&name);
            }
        }
    }

    /// Drains every binding's queued packets, in binding order.
    pub fn take_outgoing(&mut self) -> Vec<(ChannelId, Packet)> {
        let mut out = std::mem::take(&mut self.outbox);
        if let Some(host) = self.registry_host.as_mut() {
            out.extend(host.take_outgoing());
        }
        if let Some(link) = self.registry.as_mut() {
            let packets = link.replica.take_outgoing();
            if let Some(channel) = link.channel {
                out.extend(packets.into_iter().map(|p| (channel, p)));
            }
        }
        for source in self.sources.values_mut() {
            out.extend(source.take_outgoing());
        }
        for model in self.models.values_mut() {
            out.extend(model.take_outgoing());
        }
        for slot in self.replicas.values_mut() {
            let packets = slot.binding.take_outgoing();
            if let Some(channel) = slot.channel {
                out.extend(packets.into_iter().map(|p| (channel, p)));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::PropertyModifier;
    use crate::source::SimpleSource;

    fn descriptor() -> Arc<ApiDescriptor> {
        ApiDescriptor::builder("Counter")
            .property("count", "int", PropertyModifier::ReadWrite, 0i64)
            .build()
    }

    fn core(endpoint: &str) -> NodeCore {
        NodeCore::new(endpoint, NodeConfig::default()).unwrap()
    }

    #[test]
    fn test_duplicate_local_export_rejected() {
        let mut node = core("a:1");
        node.enable_remoting("counter", Box::new(SimpleSource::new(descriptor())))
            .unwrap();
        let err = node
            .enable_remoting("counter", Box::new(SimpleSource::new(descriptor())))
            .unwrap_err();
        assert!(matches!(err, RemoteObjectsError::DuplicateName { .. }));
        assert!(node
            .enable_remoting(REGISTRY_NAME, Box::new(SimpleSource::new(descriptor())))
            .is_err());
    }

    #[test]
    fn test_hosted_registry_lists_local_sources() {
        let mut node = core("a:1");
        node.enable_remoting("early", Box::new(SimpleSource::new(descriptor())))
            .unwrap();
        node.host_registry().unwrap();
        node.enable_remoting("late", Box::new(SimpleSource::new(descriptor())))
            .unwrap();
        let locations = node.source_locations();
        assert_eq!(locations.len(), 2);
        assert_eq!(locations["late"].endpoint, "a:1");
        assert!(node.disable_remoting("early"));
        assert!(!node.source_locations().contains_key("early"));
    }

    #[test]
    fn test_attach_registry_requests_dial() {
        let mut node = core("b:1");
        node.attach_registry("a:1").unwrap();
        assert_eq!(
            node.take_dials(),
            vec![DialRequest {
                endpoint: "a:1".into(),
                after: Duration::ZERO
            }]
        );
        // A failed registry dial is retried after the reconnect interval.
        node.dial_failed("a:1");
        assert_eq!(node.take_dials()[0].after, node.config().reconnect_interval());
        assert!(node.attach_registry("c:1").is_err());
    }

    #[test]
    fn test_channel_open_sends_hello_and_binds_registry() {
        let mut node = core("b:1");
        node.enable_remoting("counter", Box::new(SimpleSource::new(descriptor())))
            .unwrap();
        node.attach_registry("a:1").unwrap();
        node.take_dials();
        node.channel_opened(ChannelId(4), Some("a:1".into()));
        let out = node.take_outgoing();
        assert!(matches!(&out[0], (ChannelId(4), Packet::Hello { sources, .. }) if sources == &vec!["counter".to_string()]));
        assert!(out
            .iter()
            .any(|(_, p)| matches!(p, Packet::Handshake { name, .. } if name == REGISTRY_NAME)));
        assert_eq!(node.registry_state(), Some(ReplicaState::Handshaking));
    }

    #[test]
    fn test_unknown_source_handshake_answered() {
        let mut node = core("a:1");
        node.channel_opened(ChannelId(1), None);
        node.take_outgoing();
        node.handle_packet(
            ChannelId(1),
            Packet::Handshake {
                name: "missing".into(),
                type_name: "Counter".into(),
                signature: descriptor().signature_hex(),
            },
        );
        let out = node.take_outgoing();
        assert_eq!(
            out,
            vec![(
                ChannelId(1),
                Packet::HandshakeAck {
                    name: "missing".into(),
                    status: HandshakeStatus::NoSuchSource
                }
            )]
        );
    }

    #[test]
    fn test_heartbeat_is_acknowledged() {
        let mut node = core("a:1");
        node.channel_opened(ChannelId(2), None);
        node.take_outgoing();
        node.handle_packet(ChannelId(2), Packet::HeartBeat);
        assert_eq!(node.take_outgoing(), vec![(ChannelId(2), Packet::HeartBeatAck)]);
    }

    #[test]
    fn test_replica_binds_to_advertising_peer() {
        let mut node = core("b:1");
        node.acquire("counter", descriptor()).unwrap();
        assert!(!node.acquire("counter", descriptor()).unwrap());
        node.channel_opened(ChannelId(3), None);
        node.take_outgoing();
        node.handle_packet(
            ChannelId(3),
            Packet::Hello {
                node: NodeId::new(),
                endpoint: "a:1".into(),
                sources: vec!["counter".into()],
            },
        );
        let out = node.take_outgoing();
        assert!(matches!(&out[..], [(ChannelId(3), Packet::Handshake { name, .. })] if name == "counter"));
        assert_eq!(node.replica_state("counter"), Some(ReplicaState::Handshaking));

        node.channel_closed(ChannelId(3));
        assert_eq!(node.replica_state("counter"), Some(ReplicaState::Uninitialized));
    }
}
