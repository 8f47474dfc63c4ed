pub mod config;
pub mod descriptor;
pub mod error;
pub mod model;
pub mod network;
pub mod packet;
pub mod persist;
pub mod protocol;
pub mod registry;
pub mod replica;
pub mod source;
pub mod types;

// Re-export only what's needed by external users
pub use config::{InitialAction, ModelCacheConfig, NodeConfig};
pub use descriptor::{ApiDescriptor, PropertyModifier};
pub use error::{RemoteObjectsError, Result};
pub use model::{DataState, ItemModel, ModelEvent, ModelIndex, ModelReplica, TreeModel};
pub use network::RemoteObjectNode;
pub use packet::Packet;
pub use persist::{InMemoryStore, JsonFileStore, PersistedStore};
pub use protocol::NodeCore;
pub use registry::{RegistryHost, RegistryReplica, REGISTRY_NAME};
pub use replica::{PendingCall, Replica, ReplicaEvent, ReplicaState};
pub use source::{SimpleSource, SourceExporter, SourceObject};
pub use types::{ChannelId, NodeId, SourceLocation, SourceLocations, Value};
