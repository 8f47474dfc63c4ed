//! Network-wide `name -> location` registry.
//!
//! The registry is an ordinary binding named [`REGISTRY_NAME`] with a single
//! read-only property, `sourceLocations`. One node hosts the authoritative
//! [`RegistryHost`]; every other node holds a [`RegistryReplica`].
//!
//! Add/remove requests travel upstream as `RegistryAdd`/`RegistryRemove`
//! packets. The host applies them and broadcasts the same packets to every
//! bound replica, which mirrors them into its cached property and raises the
//! `remoteObjectAdded`/`remoteObjectRemoved` signals.

use crate::descriptor::{ApiDescriptor, PropertyModifier};
use crate::error::{RemoteObjectsError, Result};
use crate::packet::{HandshakeStatus, Packet};
use crate::replica::{Replica, ReplicaEvent, ReplicaState};
use crate::types::{
    locations_from_value, locations_to_value, ChannelId, SourceLocation, SourceLocations, Value,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const REGISTRY_NAME: &str = "Registry";

const ADDED_SIGNAL: usize = 0;
const REMOVED_SIGNAL: usize = 1;

pub fn registry_descriptor() -> Arc<ApiDescriptor> {
    ApiDescriptor::builder("QRemoteObjectRegistry")
        .property(
            "sourceLocations",
            "QRemoteObjectSourceLocations",
            PropertyModifier::ReadOnly,
            Value::List(Vec::new()),
        )
        .signal("remoteObjectAdded", &[("entry", "QRemoteObjectSourceLocation")])
        .signal("remoteObjectRemoved", &[("entry", "QRemoteObjectSourceLocation")])
        .build()
}

/// Authoritative registry state, owned by the hosting node.
pub struct RegistryHost {
    descriptor: Arc<ApiDescriptor>,
    locations: SourceLocations,
    /// Channel an entry was registered over; `None` for the host's own sources.
    owners: HashMap<String, Option<ChannelId>>,
    channels: BTreeSet<ChannelId>,
    outgoing: Vec<(ChannelId, Packet)>,
}

impl Default for RegistryHost {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryHost {
    pub fn new() -> Self {
        Self {
            descriptor: registry_descriptor(),
            locations: SourceLocations::new(),
            owners: HashMap::new(),
            channels: BTreeSet::new(),
            outgoing: Vec::new(),
        }
    }

    pub fn source_locations(&self) -> &SourceLocations {
        &self.locations
    }

    pub fn take_outgoing(&mut self) -> Vec<(ChannelId, Packet)> {
        std::mem::take(&mut self.outgoing)
    }

    pub fn handle_handshake(&mut self, channel: ChannelId, signature: &str) {
        let expected = self.descriptor.signature_hex();
        if signature != expected {
            warn!(%channel, "registry replica with a different api signature");
            self.outgoing.push((
                channel,
                Packet::HandshakeAck {
                    name: REGISTRY_NAME.to_string(),
                    status: HandshakeStatus::Mismatch { expected },
                },
            ));
            return;
        }
        self.channels.insert(channel);
        self.outgoing.push((
            channel,
            Packet::HandshakeAck {
                name: REGISTRY_NAME.to_string(),
                status: HandshakeStatus::Ok,
            },
        ));
        self.outgoing.push((
            channel,
            Packet::InitialState {
                name: REGISTRY_NAME.to_string(),
                values: vec![locations_to_value(&self.locations)],
            },
        ));
    }

    /// Registers a location.
    ///
    /// Returns `Ok(false)` when the exact entry already exists and
    /// `DuplicateName` when the name belongs to another endpoint; the
    /// original entry is kept in both cases.
    pub fn add_source(
        &mut self,
        location: SourceLocation,
        origin: Option<ChannelId>,
    ) -> Result<bool> {
        if let Some(existing) = self.locations.get(&location.name) {
            if existing.endpoint == location.endpoint {
                debug!(%location, "source already registered");
                return Ok(false);
            }
            warn!(
                name = %location.name,
                existing = %existing.endpoint,
                rejected = %location.endpoint,
                "rejecting duplicate source registration"
            );
            return Err(RemoteObjectsError::DuplicateName {
                name: location.name.clone(),
                existing: existing.endpoint.clone(),
                rejected: location.endpoint,
            });
        }

        info!(%location, "source registered");
        self.owners.insert(location.name.clone(), origin);
        self.locations.insert(location.name.clone(), location.clone());
        self.broadcast(Packet::RegistryAdd { location });
        Ok(true)
    }

    /// Removes the entry only if it still points at `location`.
    pub fn remove_source(&mut self, location: &SourceLocation) -> bool {
        if self.locations.get(&location.name) != Some(location) {
            debug!(%location, "remove for an entry that is not registered");
            return false;
        }
        self.locations.remove(&location.name);
        self.owners.remove(&location.name);
        info!(%location, "source unregistered");
        self.broadcast(Packet::RegistryRemove {
            location: location.clone(),
        });
        true
    }

    fn broadcast(&mut self, packet: Packet) {
        for channel in &self.channels {
            self.outgoing.push((*channel, packet.clone()));
        }
    }

    pub fn release(&mut self, channel: ChannelId) {
        self.channels.remove(&channel);
    }

    /// Drops the channel and every entry registered over it.
    pub fn channel_closed(&mut self, channel: ChannelId) {
        self.channels.remove(&channel);
        self.outgoing.retain(|(c, _)| *c != channel);
        let orphaned: Vec<SourceLocation> = self
            .owners
            .iter()
            .filter(|(_, owner)| **owner == Some(channel))
            .filter_map(|(name, _)| self.locations.get(name).cloned())
            .collect();
        for location in orphaned {
            self.remove_source(&location);
        }
    }
}

/// A node's view of the registry plus the sources it hosts itself.
pub struct RegistryReplica {
    replica: Replica,
    locations: SourceLocations,
    hosted: SourceLocations,
}

impl Default for RegistryReplica {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryReplica {
    pub fn new() -> Self {
        Self {
            replica: Replica::new(REGISTRY_NAME, registry_descriptor()),
            locations: SourceLocations::new(),
            hosted: SourceLocations::new(),
        }
    }

    pub fn state(&self) -> ReplicaState {
        self.replica.state()
    }

    pub fn replica(&self) -> &Replica {
        &self.replica
    }

    /// Last known registry contents.
    pub fn source_locations(&self) -> &SourceLocations {
        &self.locations
    }

    /// Sources this node hosts and wants registered.
    pub fn hosted_sources(&self) -> &SourceLocations {
        &self.hosted
    }

    pub fn take_events(&mut self) -> Vec<ReplicaEvent> {
        self.replica.take_events()
    }

    pub fn take_outgoing(&mut self) -> Vec<Packet> {
        self.replica.take_outgoing()
    }

    pub fn start_handshake(&mut self) {
        self.replica.start_handshake();
    }

    pub fn channel_lost(&mut self) {
        self.replica.channel_lost();
    }

    pub fn add_source(&mut self, location: SourceLocation) {
        if self.hosted.contains_key(&location.name) {
            warn!(%location, "source already hosted locally, not adding");
            return;
        }
        self.hosted.insert(location.name.clone(), location.clone());
        if !self.replica.is_valid() {
            return;
        }
        if let Some(existing) = self.locations.get(&location.name) {
            if existing != &location {
                warn!(
                    name = %location.name,
                    existing = %existing.endpoint,
                    "source name already registered elsewhere, not adding"
                );
            }
            return;
        }
        self.send(Packet::RegistryAdd { location });
    }

    pub fn remove_source(&mut self, location: &SourceLocation) {
        if self.hosted.get(&location.name) != Some(location) {
            return;
        }
        self.hosted.remove(&location.name);
        if self.replica.is_valid() {
            self.send(Packet::RegistryRemove {
                location: location.clone(),
            });
        }
    }

    fn send(&mut self, packet: Packet) {
        self.replica.queue(packet);
    }

    pub fn handle_packet(&mut self, packet: Packet) {
        match packet {
            Packet::RegistryAdd { location } => {
                if self.locations.get(&location.name) == Some(&location) {
                    return;
                }
                self.locations.insert(location.name.clone(), location.clone());
                self.mirror(ADDED_SIGNAL, &location);
            }
            Packet::RegistryRemove { location } => {
                if self.locations.get(&location.name) != Some(&location) {
                    return;
                }
                self.locations.remove(&location.name);
                self.mirror(REMOVED_SIGNAL, &location);
            }
            Packet::InitialState { values, .. } => {
                self.locations = values
                    .first()
                    .map(locations_from_value)
                    .unwrap_or_default();
                self.replica
                    .handle_packet(Packet::InitialState { name: REGISTRY_NAME.to_string(), values });
                if self.replica.is_valid() {
                    self.push_to_registry_if_needed();
                }
            }
            other => self.replica.handle_packet(other),
        }
    }

    fn mirror(&mut self, signal: usize, location: &SourceLocation) {
        if !self.replica.is_valid() {
            return;
        }
        self.replica
            .apply_local(0, locations_to_value(&self.locations));
        self.replica.push_event(ReplicaEvent::Signal {
            index: signal,
            args: vec![location.to_value()],
        });
    }

    /// Replays hosted entries missing from the registry. Entries the
    /// registry holds for another endpoint are dropped with a warning.
    fn push_to_registry_if_needed(&mut self) {
        let registered = &self.locations;
        self.hosted.retain(|name, location| match registered.get(name) {
            Some(existing) if existing != location => {
                warn!(
                    name = %name,
                    existing = %existing.endpoint,
                    dropped = %location.endpoint,
                    "hosted source already registered elsewhere, dropping"
                );
                false
            }
            _ => true,
        });
        let missing: Vec<SourceLocation> = self
            .hosted
            .values()
            .filter(|location| !self.locations.contains_key(&location.name))
            .cloned()
            .collect();
        for location in missing {
            debug!(%location, "re-registering hosted source");
            self.send(Packet::RegistryAdd { location });
        }
    }
}
