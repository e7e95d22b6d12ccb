#![warn(missing_docs)]

//! tabletmgr topology subsystem: coordination store client, tablet/shard/keyspace
//! records, action locks and the derived serving graph.

pub mod error;
pub mod lock;
pub mod memory;
pub mod paths;
pub mod rebuild;
pub mod remote;
pub mod store;
pub mod topo;
pub mod types;
pub mod wire;

pub use error::TopoError;
pub use lock::{lock_keyspace, lock_shard, ActionLock, LockInfo};
pub use memory::{MemoryTopoClient, MemoryTopoServer};
pub use rebuild::{rebuild_keyspace_graph, rebuild_shard_graph, RebuildReport};
pub use remote::{serve_memory_topo, RemoteTopoClient};
pub use store::{CreateMode, TopoStore, Version, Watch, WatchEvent, WatchKind};
pub use topo::Topo;
pub use wire::{read_frame, write_frame, WireError};
pub use types::{
    AgentInfo, EndPoint, EndPoints, KeyRange, Keyspace, KeyspaceId, Shard, SrvKeyspace,
    SrvShardRef, Tablet, TabletAlias, TabletState, TabletType,
};
