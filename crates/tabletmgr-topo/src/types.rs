//! Tablet, shard, keyspace and serving-graph records.
//!
//! Every record stored in the coordination tree is one of the types in this
//! module, encoded as JSON. Key ranges follow the lower-inclusive,
//! upper-exclusive convention; an empty bound is unbounded.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::TopoError;

/// Identifies a tablet: the cell it lives in plus a numeric uid.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TabletAlias {
    /// Cell (data center) name.
    pub cell: String,
    /// Numeric tablet id, unique within the cell.
    pub uid: u32,
}

impl TabletAlias {
    /// Creates a new alias.
    pub fn new(cell: impl Into<String>, uid: u32) -> Self {
        Self {
            cell: cell.into(),
            uid,
        }
    }

    /// Zero-padded uid, used in paths and directory names.
    pub fn uid_str(&self) -> String {
        format!("{:010}", self.uid)
    }
}

impl fmt::Display for TabletAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:010}", self.cell, self.uid)
    }
}

impl FromStr for TabletAlias {
    type Err = TopoError;

    /// Parses `cell-0000062344` (or `cell-62344`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (cell, uid) = s
            .rsplit_once('-')
            .ok_or_else(|| TopoError::InvalidArgument(format!("bad tablet alias: {}", s)))?;
        if cell.is_empty() {
            return Err(TopoError::InvalidArgument(format!("bad tablet alias: {}", s)));
        }
        let uid = uid
            .parse::<u32>()
            .map_err(|_| TopoError::InvalidArgument(format!("bad tablet uid in alias: {}", s)))?;
        Ok(Self::new(cell, uid))
    }
}

/// Role of a tablet within its shard.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TabletType {
    /// Not assigned to any shard.
    Idle,
    /// The single read-write tablet of a shard.
    Master,
    /// Serving replica.
    Replica,
    /// Replicating but not serving.
    Spare,
    /// Deliberately lagging replica, not serving.
    Lag,
    /// Logically dead; record kept for audit until purged.
    Scrap,
}

impl TabletType {
    /// All types, in declaration order.
    pub const ALL: [TabletType; 6] = [
        TabletType::Idle,
        TabletType::Master,
        TabletType::Replica,
        TabletType::Spare,
        TabletType::Lag,
        TabletType::Scrap,
    ];

    /// Types that appear in the serving graph.
    pub const SERVING: [TabletType; 2] = [TabletType::Master, TabletType::Replica];

    /// True for types that appear in the serving graph.
    pub fn is_serving(self) -> bool {
        matches!(self, TabletType::Master | TabletType::Replica)
    }

    /// True for types that take part in replication (shard membership).
    pub fn is_in_replication_graph(self) -> bool {
        matches!(
            self,
            TabletType::Master | TabletType::Replica | TabletType::Spare | TabletType::Lag
        )
    }

    /// True for types that are bound to a keyspace/shard.
    pub fn is_assigned(self) -> bool {
        !matches!(self, TabletType::Idle | TabletType::Scrap)
    }

    /// Lowercase name, as stored and displayed.
    pub fn as_str(self) -> &'static str {
        match self {
            TabletType::Idle => "idle",
            TabletType::Master => "master",
            TabletType::Replica => "replica",
            TabletType::Spare => "spare",
            TabletType::Lag => "lag",
            TabletType::Scrap => "scrap",
        }
    }
}

impl fmt::Display for TabletType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TabletType {
    type Err = TopoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TabletType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| TopoError::InvalidArgument(format!("unknown tablet type: {}", s)))
    }
}

/// Health/lock state of a tablet, orthogonal to its type.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TabletState {
    /// Normal duty.
    #[default]
    Serving,
    /// Left read-only after a server-mode snapshot, serving snapshot files.
    SnapshotSource,
    /// Being loaded by a restore or clone.
    Restoring,
}

/// Raw sharding key. Ordered bytewise; displayed as hex.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyspaceId(pub Vec<u8>);

impl KeyspaceId {
    /// Key for a 64-bit integer sharding column (big-endian).
    pub fn from_u64(v: u64) -> Self {
        KeyspaceId(v.to_be_bytes().to_vec())
    }

    /// Parses a hex string; the empty string is the empty key.
    pub fn from_hex(s: &str) -> Result<Self, TopoError> {
        hex::decode(s)
            .map(KeyspaceId)
            .map_err(|e| TopoError::InvalidArgument(format!("bad hex key '{}': {}", s, e)))
    }

    /// Lowercase hex form.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// True for the empty (unbounded) key.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for KeyspaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for KeyspaceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for KeyspaceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        KeyspaceId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Half-open key range `[start, end)`. Empty bounds are unbounded.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    /// Inclusive lower bound; empty means no lower bound.
    pub start: KeyspaceId,
    /// Exclusive upper bound; empty means no upper bound.
    pub end: KeyspaceId,
}

impl KeyRange {
    /// Creates a range, rejecting inverted bounds.
    pub fn new(start: KeyspaceId, end: KeyspaceId) -> Result<Self, TopoError> {
        if !start.is_empty() && !end.is_empty() && start >= end {
            return Err(TopoError::InvalidArgument(format!(
                "key range start {} must be below end {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    /// Parses hex bounds.
    pub fn from_hex(start: &str, end: &str) -> Result<Self, TopoError> {
        Self::new(KeyspaceId::from_hex(start)?, KeyspaceId::from_hex(end)?)
    }

    /// The full, unbounded range.
    pub fn full() -> Self {
        Self::default()
    }

    /// True when neither bound is set.
    pub fn is_full(&self) -> bool {
        self.start.is_empty() && self.end.is_empty()
    }

    /// True when `key` lies inside `[start, end)`.
    pub fn contains(&self, key: &KeyspaceId) -> bool {
        (self.start.is_empty() || *key >= self.start) && (self.end.is_empty() || *key < self.end)
    }

    /// True when the two ranges share at least one key.
    pub fn intersects(&self, other: &KeyRange) -> bool {
        let below_other_end = other.end.is_empty() || self.start < other.end;
        let above_other_start = self.end.is_empty() || other.start < self.end;
        below_other_end && above_other_start
    }

    /// Intersection of two ranges, if not empty.
    pub fn intersect(&self, other: &KeyRange) -> Option<KeyRange> {
        if !self.intersects(other) {
            return None;
        }
        let start = std::cmp::max(&self.start, &other.start).clone();
        let end = match (self.end.is_empty(), other.end.is_empty()) {
            (true, _) => other.end.clone(),
            (_, true) => self.end.clone(),
            _ => std::cmp::min(&self.end, &other.end).clone(),
        };
        Some(KeyRange { start, end })
    }

    /// Range implied by a shard name: `start-end` in hex, otherwise full.
    pub fn from_shard_name(shard: &str) -> Result<Self, TopoError> {
        match shard.split_once('-') {
            Some((start, end)) => Self::from_hex(start, end),
            None => Ok(Self::full()),
        }
    }

    /// Parses a split spec such as `-0000000000000028-` into disjoint,
    /// contiguous ranges. Interior boundaries must be non-empty and strictly
    /// increasing; the outer ones may be empty (unbounded).
    pub fn parse_split_spec(spec: &str) -> Result<Vec<KeyRange>, TopoError> {
        let bounds: Vec<KeyspaceId> = spec
            .split('-')
            .map(KeyspaceId::from_hex)
            .collect::<Result<_, _>>()?;
        if bounds.len() < 2 {
            return Err(TopoError::InvalidArgument(format!(
                "split spec '{}' needs at least two boundaries",
                spec
            )));
        }
        let last = bounds.len() - 1;
        if bounds[1..last].iter().any(KeyspaceId::is_empty) {
            return Err(TopoError::InvalidArgument(format!(
                "split spec '{}' has an empty interior boundary",
                spec
            )));
        }
        bounds
            .windows(2)
            .map(|w| KeyRange::new(w[0].clone(), w[1].clone()))
            .collect()
    }

    /// Directory name for an export unit of this range: `<keyspace>-<start>,<end>`.
    pub fn dir_name(&self, keyspace: &str) -> String {
        format!("{}-{},{}", keyspace, self.start, self.end)
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Tablet record, stored at `/cells/<cell>/tablets/<uid>`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tablet {
    /// Identity.
    pub alias: TabletAlias,
    /// Host the agent and data engine run on.
    pub hostname: String,
    /// Agent RPC port.
    pub port: u16,
    /// Data engine port.
    pub engine_port: u16,
    /// Keyspace, empty when idle.
    pub keyspace: String,
    /// Shard name, empty when idle.
    pub shard: String,
    /// Current role.
    pub tablet_type: TabletType,
    /// Database name inside the data engine.
    pub db_name: String,
    /// Key range the tablet holds data for.
    #[serde(default)]
    pub key_range: KeyRange,
    /// Tablet this one replicates from.
    #[serde(default)]
    pub parent: Option<TabletAlias>,
    /// Health/lock state.
    #[serde(default)]
    pub state: TabletState,
}

impl Tablet {
    /// A fresh idle tablet.
    pub fn idle(alias: TabletAlias, hostname: impl Into<String>, port: u16, engine_port: u16) -> Self {
        let db_name = format!("vt_{}", alias.uid_str());
        Self {
            alias,
            hostname: hostname.into(),
            port,
            engine_port,
            keyspace: String::new(),
            shard: String::new(),
            tablet_type: TabletType::Idle,
            db_name,
            key_range: KeyRange::full(),
            parent: None,
            state: TabletState::Serving,
        }
    }

    /// `host:port` of the agent RPC endpoint.
    pub fn agent_addr(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }

    /// `host:port` of the data engine.
    pub fn engine_addr(&self) -> String {
        format!("{}:{}", self.hostname, self.engine_port)
    }

    /// True when bound to a keyspace and shard.
    pub fn is_assigned(&self) -> bool {
        self.tablet_type.is_assigned() && !self.keyspace.is_empty() && !self.shard.is_empty()
    }

    /// True when the tablet belongs in the serving graph.
    pub fn is_in_serving_graph(&self) -> bool {
        self.is_assigned() && self.tablet_type.is_serving() && self.state != TabletState::Restoring
    }

    /// True when the tablet belongs to its shard's replication graph.
    pub fn is_in_replication_graph(&self) -> bool {
        self.is_assigned() && self.tablet_type.is_in_replication_graph()
    }

    /// Serving-graph entry for this tablet.
    pub fn endpoint(&self) -> EndPoint {
        let mut named_ports = BTreeMap::new();
        named_ports.insert("agent".to_string(), self.port);
        named_ports.insert("engine".to_string(), self.engine_port);
        EndPoint {
            uid: self.alias.uid,
            host: self.hostname.clone(),
            named_ports,
        }
    }
}

/// Keyspace record, stored at `/global/keyspaces/<ks>`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keyspace {
    /// Column rows are sharded on, when known.
    #[serde(default)]
    pub sharding_column: Option<String>,
}

/// Shard record, stored at `/global/keyspaces/<ks>/shards/<shard>`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    /// Current master, if any.
    pub master: Option<TabletAlias>,
    /// Non-master members of the replication graph, sorted.
    pub replicas: Vec<TabletAlias>,
    /// Key range covered by the shard.
    pub key_range: KeyRange,
    /// Cells with at least one member, sorted.
    pub cells: Vec<String>,
}

impl Shard {
    /// Empty shard record for a shard name.
    pub fn for_name(shard: &str) -> Result<Self, TopoError> {
        Ok(Self {
            key_range: KeyRange::from_shard_name(shard)?,
            ..Default::default()
        })
    }

    /// Master plus replicas.
    pub fn members(&self) -> Vec<TabletAlias> {
        self.master
            .iter()
            .cloned()
            .chain(self.replicas.iter().cloned())
            .collect()
    }
}

/// One address in the serving graph.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndPoint {
    /// Tablet uid.
    pub uid: u32,
    /// Host name.
    pub host: String,
    /// Port by name (`agent`, `engine`).
    pub named_ports: BTreeMap<String, u16>,
}

/// Serving-graph node for (cell, keyspace, shard, type).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndPoints {
    /// Entries sorted by uid.
    pub entries: Vec<EndPoint>,
}

/// A shard reference in the keyspace serving graph.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SrvShardRef {
    /// Shard name.
    pub name: String,
    /// Range covered.
    pub key_range: KeyRange,
}

/// Keyspace-level serving graph node for one cell.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SrvKeyspace {
    /// Serving shards by tablet type, ordered by range start.
    pub partitions: BTreeMap<TabletType, Vec<SrvShardRef>>,
}

/// Liveness record published by an agent as an ephemeral node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    /// Host the agent runs on.
    pub hostname: String,
    /// Agent RPC port.
    pub port: u16,
    /// OS process id.
    pub pid: u32,
    /// When the agent started.
    pub started_at: chrono::DateTime<chrono::Utc>,
    /// Last heartbeat.
    pub heartbeat_at: chrono::DateTime<chrono::Utc>,
}
