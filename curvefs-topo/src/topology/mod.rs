//! Cluster topology model: pools contain zones, zones contain servers.
//!
//! Entities are stored in three ordered maps keyed by their path within the
//! tree. Parents are found by key lookup, so there are no back pointers and
//! iteration order is always the lexicographic key order.

pub mod document;

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use document::{parse_document, ParseOptions, TopologyDocument, ValidationError};

pub const DEFAULT_REPLICAS: u32 = 3;
pub const DEFAULT_COPYSETS: u32 = 100;

/// Network endpoint of a server (`host:port`, IPv6 hosts in brackets).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| format!("expected host:port, got '{}'", s))?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            return Err(format!("missing host in '{}'", s));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| format!("invalid port in '{}'", s))?;
        if port == 0 {
            return Err(format!("port must be non-zero in '{}'", s));
        }
        Ok(Self::new(host, port))
    }
}

/// Pool attributes fixed at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolAttrs {
    pub replicas: u32,
    pub copysets: u32,
}

impl Default for PoolAttrs {
    fn default() -> Self {
        Self {
            replicas: DEFAULT_REPLICAS,
            copysets: DEFAULT_COPYSETS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool {
    pub name: String,
    pub attrs: PoolAttrs,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zone {
    pub pool: String,
    pub name: String,
}

/// Server attributes compared by the differencer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerAttrs {
    pub internal: Endpoint,
    pub external: Option<Endpoint>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub pool: String,
    pub zone: String,
    pub name: String,
    pub attrs: ServerAttrs,
}

impl Pool {
    pub fn key(&self) -> EntityKey {
        EntityKey::Pool(self.name.clone())
    }
}

impl Zone {
    pub fn key(&self) -> EntityKey {
        EntityKey::Zone(self.pool.clone(), self.name.clone())
    }
}

impl Server {
    pub fn key(&self) -> EntityKey {
        EntityKey::Server(self.pool.clone(), self.zone.clone(), self.name.clone())
    }
}

/// Full path of an entity in the topology tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKey {
    Pool(String),
    Zone(String, String),
    Server(String, String, String),
}

impl EntityKey {
    pub fn segments(&self) -> Vec<&str> {
        match self {
            EntityKey::Pool(p) => vec![p],
            EntityKey::Zone(p, z) => vec![p, z],
            EntityKey::Server(p, z, s) => vec![p, z, s],
        }
    }

    pub fn pool(&self) -> &str {
        match self {
            EntityKey::Pool(p) | EntityKey::Zone(p, _) | EntityKey::Server(p, _, _) => p,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            EntityKey::Pool(_) => "pool",
            EntityKey::Zone(..) => "zone",
            EntityKey::Server(..) => "server",
        }
    }

    /// True if `self` is a strict ancestor of `other`.
    pub fn is_ancestor_of(&self, other: &EntityKey) -> bool {
        let mine = self.segments();
        let theirs = other.segments();
        mine.len() < theirs.len() && theirs[..mine.len()] == mine[..]
    }
}

impl Ord for EntityKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.segments().cmp(&other.segments())
    }
}

impl PartialOrd for EntityKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in self.segments() {
            write!(f, "/{}", segment)?;
        }
        Ok(())
    }
}

/// Structural errors raised while building or mutating a graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("duplicate {}: {}", .0.kind(), .0)]
    Duplicate(EntityKey),

    #[error("{} {} references missing parent {}", .child.kind(), .child, .parent)]
    MissingParent { child: EntityKey, parent: EntityKey },

    #[error("{}: not found", .0)]
    NotFound(EntityKey),

    #[error("{} still has children", .0)]
    HasChildren(EntityKey),
}

type ZoneKey = (String, String);
type ServerKey = (String, String, String);

/// Arena-style Pool → Zone → Server tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopologyGraph {
    pools: BTreeMap<String, Pool>,
    zones: BTreeMap<ZoneKey, Zone>,
    servers: BTreeMap<ServerKey, Server>,
}

impl TopologyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    pub fn pools(&self) -> impl Iterator<Item = &Pool> {
        self.pools.values()
    }

    pub fn zones(&self) -> impl Iterator<Item = &Zone> {
        self.zones.values()
    }

    pub fn servers(&self) -> impl Iterator<Item = &Server> {
        self.servers.values()
    }

    pub fn pool(&self, name: &str) -> Option<&Pool> {
        self.pools.get(name)
    }

    pub fn zone(&self, pool: &str, zone: &str) -> Option<&Zone> {
        self.zones.get(&(pool.to_string(), zone.to_string()))
    }

    pub fn server(&self, pool: &str, zone: &str, server: &str) -> Option<&Server> {
        self.servers
            .get(&(pool.to_string(), zone.to_string(), server.to_string()))
    }

    pub fn zones_in<'a>(&'a self, pool: &'a str) -> impl Iterator<Item = &'a Zone> + 'a {
        self.zones.values().filter(move |z| z.pool == pool)
    }

    pub fn servers_in<'a>(
        &'a self,
        pool: &'a str,
        zone: &'a str,
    ) -> impl Iterator<Item = &'a Server> + 'a {
        self.servers
            .values()
            .filter(move |s| s.pool == pool && s.zone == zone)
    }

    /// All keys in parent-before-child order.
    pub fn keys(&self) -> Vec<EntityKey> {
        let mut keys: Vec<EntityKey> = self
            .pools()
            .map(Pool::key)
            .chain(self.zones().map(Zone::key))
            .chain(self.servers().map(Server::key))
            .collect();
        keys.sort();
        keys
    }

    pub fn insert_pool(&mut self, pool: Pool) -> Result<(), GraphError> {
        if self.pools.contains_key(&pool.name) {
            return Err(GraphError::Duplicate(pool.key()));
        }
        self.pools.insert(pool.name.clone(), pool);
        Ok(())
    }

    pub fn insert_zone(&mut self, zone: Zone) -> Result<(), GraphError> {
        if !self.pools.contains_key(&zone.pool) {
            return Err(GraphError::MissingParent {
                child: zone.key(),
                parent: EntityKey::Pool(zone.pool.clone()),
            });
        }
        let key = (zone.pool.clone(), zone.name.clone());
        if self.zones.contains_key(&key) {
            return Err(GraphError::Duplicate(zone.key()));
        }
        self.zones.insert(key, zone);
        Ok(())
    }

    pub fn insert_server(&mut self, server: Server) -> Result<(), GraphError> {
        let zone_key = (server.pool.clone(), server.zone.clone());
        if !self.zones.contains_key(&zone_key) {
            return Err(GraphError::MissingParent {
                child: server.key(),
                parent: EntityKey::Zone(server.pool.clone(), server.zone.clone()),
            });
        }
        let key = (server.pool.clone(), server.zone.clone(), server.name.clone());
        if self.servers.contains_key(&key) {
            return Err(GraphError::Duplicate(server.key()));
        }
        self.servers.insert(key, server);
        Ok(())
    }

    /// Replace the attributes of an existing server.
    pub fn replace_server(&mut self, server: Server) -> Result<Server, GraphError> {
        let key = (server.pool.clone(), server.zone.clone(), server.name.clone());
        match self.servers.get_mut(&key) {
            Some(existing) => Ok(std::mem::replace(existing, server)),
            None => Err(GraphError::NotFound(server.key())),
        }
    }

    pub fn remove_server(
        &mut self,
        pool: &str,
        zone: &str,
        name: &str,
    ) -> Result<Server, GraphError> {
        self.servers
            .remove(&(pool.to_string(), zone.to_string(), name.to_string()))
            .ok_or_else(|| {
                GraphError::NotFound(EntityKey::Server(
                    pool.to_string(),
                    zone.to_string(),
                    name.to_string(),
                ))
            })
    }

    pub fn remove_zone(&mut self, pool: &str, name: &str) -> Result<Zone, GraphError> {
        let key = EntityKey::Zone(pool.to_string(), name.to_string());
        if !self.zones.contains_key(&(pool.to_string(), name.to_string())) {
            return Err(GraphError::NotFound(key));
        }
        if self.servers_in(pool, name).next().is_some() {
            return Err(GraphError::HasChildren(key));
        }
        self.zones
            .remove(&(pool.to_string(), name.to_string()))
            .ok_or(GraphError::NotFound(key))
    }

    pub fn remove_pool(&mut self, name: &str) -> Result<Pool, GraphError> {
        let key = EntityKey::Pool(name.to_string());
        if !self.pools.contains_key(name) {
            return Err(GraphError::NotFound(key));
        }
        if self.zones_in(name).next().is_some() {
            return Err(GraphError::HasChildren(key));
        }
        self.pools.remove(name).ok_or(GraphError::NotFound(key))
    }
}

/// Topology declared by the cluster map. Immutable once parsed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredState(TopologyGraph);

/// Snapshot of the topology held by the MDS at the start of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveState(TopologyGraph);

impl DesiredState {
    pub fn new(graph: TopologyGraph) -> Self {
        Self(graph)
    }

    pub fn graph(&self) -> &TopologyGraph {
        &self.0
    }
}

impl LiveState {
    pub fn new(graph: TopologyGraph) -> Self {
        Self(graph)
    }

    pub fn graph(&self) -> &TopologyGraph {
        &self.0
    }
}

impl Deref for DesiredState {
    type Target = TopologyGraph;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Deref for LiveState {
    type Target = TopologyGraph;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
