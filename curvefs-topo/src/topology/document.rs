//! Cluster map parsing.
//!
//! Two JSON layouts are accepted:
//!
//! ```text
//! nested: {"pools": {"pool1": {"replicas": 3, "copysets": 100,
//!            "zones": {"zone1": [{"name": "s1", "internal": "10.0.0.1:9000"}]}}}}
//!
//! flat:   {"pools":   [{"name": "pool1", "replicasnum": 3, "copysetnum": 100}],
//!          "servers": [{"name": "s1", "internalip": "10.0.0.1", "internalport": 9000,
//!                       "zone": "zone1", "pool": "pool1"}]}
//! ```
//!
//! The flat layout is the one shipped as `topo_example.json`. Zones are implied
//! by the servers that reference them.

use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;

use serde::de::{MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use super::{
    DesiredState, Endpoint, GraphError, Pool, PoolAttrs, Server, ServerAttrs, TopologyGraph,
    Zone, DEFAULT_COPYSETS, DEFAULT_REPLICAS,
};

/// Errors found in a cluster map before anything is sent to the MDS.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("malformed cluster map: {0}")]
    Malformed(String),

    #[error("duplicate key '{key}' in {scope}")]
    DuplicateKey { scope: String, key: String },

    #[error("missing required field '{field}' in {scope}")]
    MissingField { scope: String, field: &'static str },

    #[error("{scope} references undeclared {reference}")]
    DanglingReference { scope: String, reference: String },

    #[error("pool '{pool}' has no zones")]
    DanglingPool { pool: String },

    #[error("invalid name '{name}' in {scope}")]
    InvalidName { scope: String, name: String },

    #[error("invalid endpoint '{value}' in {scope}: {reason}")]
    InvalidEndpoint {
        scope: String,
        value: String,
        reason: String,
    },

    #[error("cluster map declares no pools")]
    EmptyTopology,
}

pub type Result<T> = std::result::Result<T, ValidationError>;

/// Parser behaviour that depends on the requested operation.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParseOptions {
    /// Accept a document without pools.
    pub allow_empty: bool,
}

/// Parse a cluster map into the desired topology.
pub fn parse_document(text: &str, options: &ParseOptions) -> Result<DesiredState> {
    let raw: RawDocument =
        serde_json::from_str(text).map_err(|e| ValidationError::Malformed(e.to_string()))?;

    let graph = match (raw.pools, raw.servers) {
        (Some(RawPools::Nested(pools)), None) => build_nested(pools)?,
        (Some(RawPools::Nested(_)), Some(_)) => {
            return Err(ValidationError::Malformed(
                "a top-level 'servers' list cannot be combined with nested pools".to_string(),
            ))
        }
        (Some(RawPools::Flat(pools)), servers) => build_flat(pools, servers.unwrap_or_default())?,
        (None, Some(servers)) => build_flat(Vec::new(), servers)?,
        (None, None) => TopologyGraph::new(),
    };

    if graph.is_empty() && !options.allow_empty {
        return Err(ValidationError::EmptyTopology);
    }
    Ok(DesiredState::new(graph))
}

// =============================================================================
// Raw document
// =============================================================================

#[derive(Deserialize)]
struct RawDocument {
    pools: Option<RawPools>,
    servers: Option<Vec<FlatServer>>,
}

enum RawPools {
    Nested(Vec<(String, NestedPool)>),
    Flat(Vec<FlatPool>),
}

#[derive(Deserialize)]
struct NestedPool {
    replicas: Option<u32>,
    copysets: Option<u32>,
    zones: Option<Entries<Vec<NestedServer>>>,
}

#[derive(Deserialize)]
struct NestedServer {
    name: Option<String>,
    #[serde(alias = "endpoint")]
    internal: Option<String>,
    external: Option<String>,
}

#[derive(Deserialize)]
struct FlatPool {
    name: Option<String>,
    replicasnum: Option<u32>,
    copysetnum: Option<u32>,
}

#[derive(Deserialize)]
struct FlatServer {
    name: Option<String>,
    internalip: Option<String>,
    internalport: Option<u16>,
    externalip: Option<String>,
    externalport: Option<u16>,
    zone: Option<String>,
    pool: Option<String>,
}

/// JSON object kept as an ordered list so repeated keys stay visible.
struct Entries<T>(Vec<(String, T)>);

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Entries<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct EntriesVisitor<T>(PhantomData<T>);

        impl<'de, T: Deserialize<'de>> Visitor<'de> for EntriesVisitor<T> {
            type Value = Entries<T>;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a JSON object")
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut map: A,
            ) -> std::result::Result<Self::Value, A::Error> {
                let mut entries = Vec::new();
                while let Some((key, value)) = map.next_entry::<String, T>()? {
                    entries.push((key, value));
                }
                Ok(Entries(entries))
            }
        }

        deserializer.deserialize_map(EntriesVisitor(PhantomData))
    }
}

impl<'de> Deserialize<'de> for RawPools {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct PoolsVisitor;

        impl<'de> Visitor<'de> for PoolsVisitor {
            type Value = RawPools;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an object of pools keyed by name or a list of pools")
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut map: A,
            ) -> std::result::Result<Self::Value, A::Error> {
                let mut pools = Vec::new();
                while let Some((name, pool)) = map.next_entry::<String, NestedPool>()? {
                    pools.push((name, pool));
                }
                Ok(RawPools::Nested(pools))
            }

            fn visit_seq<A: SeqAccess<'de>>(
                self,
                mut seq: A,
            ) -> std::result::Result<Self::Value, A::Error> {
                let mut pools = Vec::new();
                while let Some(pool) = seq.next_element::<FlatPool>()? {
                    pools.push(pool);
                }
                Ok(RawPools::Flat(pools))
            }
        }

        deserializer.deserialize_any(PoolsVisitor)
    }
}

// =============================================================================
// Graph construction
// =============================================================================

fn check_name(scope: &str, name: &str) -> Result<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed.contains('/') {
        return Err(ValidationError::InvalidName {
            scope: scope.to_string(),
            name: name.to_string(),
        });
    }
    Ok(trimmed.to_string())
}

fn require<T>(value: Option<T>, scope: &str, field: &'static str) -> Result<T> {
    value.ok_or_else(|| ValidationError::MissingField {
        scope: scope.to_string(),
        field,
    })
}

fn parse_endpoint(scope: &str, value: &str) -> Result<Endpoint> {
    value
        .parse()
        .map_err(|reason| ValidationError::InvalidEndpoint {
            scope: scope.to_string(),
            value: value.to_string(),
            reason,
        })
}

fn graph_error(scope: &str, err: GraphError) -> ValidationError {
    match err {
        GraphError::Duplicate(key) => ValidationError::DuplicateKey {
            scope: scope.to_string(),
            key: key.to_string(),
        },
        GraphError::MissingParent { parent, .. } => ValidationError::DanglingReference {
            scope: scope.to_string(),
            reference: format!("{} {}", parent.kind(), parent),
        },
        other => ValidationError::Malformed(other.to_string()),
    }
}

fn build_nested(pools: Vec<(String, NestedPool)>) -> Result<TopologyGraph> {
    let mut graph = TopologyGraph::new();

    for (pool_name, raw_pool) in pools {
        let pool_name = check_name("pools", &pool_name)?;
        let pool_scope = format!("pool '{}'", pool_name);
        graph
            .insert_pool(Pool {
                name: pool_name.clone(),
                attrs: PoolAttrs {
                    replicas: raw_pool.replicas.unwrap_or(DEFAULT_REPLICAS),
                    copysets: raw_pool.copysets.unwrap_or(DEFAULT_COPYSETS),
                },
            })
            .map_err(|e| graph_error("pools", e))?;

        let zones = raw_pool.zones.map(|z| z.0).unwrap_or_default();
        if zones.is_empty() {
            return Err(ValidationError::DanglingPool { pool: pool_name });
        }

        for (zone_name, servers) in zones {
            let zone_name = check_name(&pool_scope, &zone_name)?;
            graph
                .insert_zone(Zone {
                    pool: pool_name.clone(),
                    name: zone_name.clone(),
                })
                .map_err(|e| graph_error(&pool_scope, e))?;

            let zone_scope = format!("zone '/{}/{}'", pool_name, zone_name);
            for (index, raw) in servers.into_iter().enumerate() {
                let scope = format!("{} server #{}", zone_scope, index);
                let name = check_name(&scope, &require(raw.name, &scope, "name")?)?;
                let internal = require(raw.internal, &scope, "internal")?;
                let attrs = ServerAttrs {
                    internal: parse_endpoint(&scope, &internal)?,
                    external: raw
                        .external
                        .map(|e| parse_endpoint(&scope, &e))
                        .transpose()?,
                };
                graph
                    .insert_server(Server {
                        pool: pool_name.clone(),
                        zone: zone_name.clone(),
                        name,
                        attrs,
                    })
                    .map_err(|e| graph_error(&zone_scope, e))?;
            }
        }
    }

    Ok(graph)
}

fn build_flat(pools: Vec<FlatPool>, servers: Vec<FlatServer>) -> Result<TopologyGraph> {
    let mut graph = TopologyGraph::new();

    for (index, raw) in pools.into_iter().enumerate() {
        let scope = format!("pools[{}]", index);
        let name = check_name(&scope, &require(raw.name, &scope, "name")?)?;
        graph
            .insert_pool(Pool {
                name,
                attrs: PoolAttrs {
                    replicas: raw.replicasnum.unwrap_or(DEFAULT_REPLICAS),
                    copysets: raw.copysetnum.unwrap_or(DEFAULT_COPYSETS),
                },
            })
            .map_err(|e| graph_error("pools", e))?;
    }

    for (index, raw) in servers.into_iter().enumerate() {
        let scope = format!("servers[{}]", index);
        let name = check_name(&scope, &require(raw.name, &scope, "name")?)?;
        let pool = check_name(&scope, &require(raw.pool, &scope, "pool")?)?;
        let zone = check_name(&scope, &require(raw.zone, &scope, "zone")?)?;
        let internal = Endpoint::new(
            require(raw.internalip, &scope, "internalip")?,
            require(raw.internalport, &scope, "internalport")?,
        );
        let internal = parse_endpoint(&scope, &internal.to_string())?;
        let external = match (raw.externalip, raw.externalport) {
            (Some(ip), Some(port)) => {
                Some(parse_endpoint(&scope, &Endpoint::new(ip, port).to_string())?)
            }
            (None, None) => None,
            (Some(_), None) => {
                return Err(ValidationError::MissingField {
                    scope,
                    field: "externalport",
                })
            }
            (None, Some(_)) => {
                return Err(ValidationError::MissingField {
                    scope,
                    field: "externalip",
                })
            }
        };

        if graph.pool(&pool).is_none() {
            return Err(ValidationError::DanglingReference {
                scope,
                reference: format!("pool /{}", pool),
            });
        }
        if graph.zone(&pool, &zone).is_none() {
            graph
                .insert_zone(Zone {
                    pool: pool.clone(),
                    name: zone.clone(),
                })
                .map_err(|e| graph_error(&scope, e))?;
        }
        graph
            .insert_server(Server {
                pool: pool.clone(),
                zone: zone.clone(),
                name,
                attrs: ServerAttrs { internal, external },
            })
            .map_err(|e| graph_error(&format!("zone '/{}/{}'", pool, zone), e))?;
    }

    if let Some(empty) = graph
        .pools()
        .find(|p| graph.zones_in(&p.name).next().is_none())
    {
        return Err(ValidationError::DanglingPool {
            pool: empty.name.clone(),
        });
    }

    Ok(graph)
}

// =============================================================================
// Serialization
// =============================================================================

/// Nested cluster map, as written back out by `list_topology`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyDocument {
    pub pools: BTreeMap<String, PoolEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolEntry {
    pub replicas: u32,
    pub copysets: u32,
    pub zones: BTreeMap<String, Vec<ServerEntry>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEntry {
    pub name: String,
    pub internal: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external: Option<String>,
}

impl TopologyDocument {
    pub fn from_graph(graph: &TopologyGraph) -> Self {
        let pools = graph
            .pools()
            .map(|pool| {
                let zones = graph
                    .zones_in(&pool.name)
                    .map(|zone| {
                        let servers = graph
                            .servers_in(&pool.name, &zone.name)
                            .map(|s| ServerEntry {
                                name: s.name.clone(),
                                internal: s.attrs.internal.to_string(),
                                external: s.attrs.external.as_ref().map(ToString::to_string),
                            })
                            .collect();
                        (zone.name.clone(), servers)
                    })
                    .collect();
                (
                    pool.name.clone(),
                    PoolEntry {
                        replicas: pool.attrs.replicas,
                        copysets: pool.attrs.copysets,
                        zones,
                    },
                )
            })
            .collect();
        Self { pools }
    }

    pub fn to_json_pretty(&self) -> String {
        // Maps of strings and integers always serialize.
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::EntityKey;

    fn strict() -> ParseOptions {
        ParseOptions::default()
    }

    const NESTED: &str = r#"{
        "pools": {
            "pool1": {
                "replicas": 3,
                "copysets": 64,
                "zones": {
                    "zone1": [{"name": "server1", "internal": "10.0.0.1:9000"}],
                    "zone2": [
                        {"name": "server2", "internal": "10.0.0.2:9000", "external": "192.168.0.2:9000"},
                        {"name": "server3", "endpoint": "10.0.0.3:9000"}
                    ]
                }
            },
            "pool2": {"zones": {"zone1": []}}
        }
    }"#;

    #[test]
    fn test_parse_nested() {
        let desired = parse_document(NESTED, &strict()).unwrap();

        assert_eq!(desired.pools().count(), 2);
        assert_eq!(desired.zones().count(), 3);
        assert_eq!(desired.servers().count(), 3);

        let pool1 = desired.pool("pool1").unwrap();
        assert_eq!(pool1.attrs.copysets, 64);
        let pool2 = desired.pool("pool2").unwrap();
        assert_eq!(pool2.attrs, PoolAttrs::default());

        let s2 = desired.server("pool1", "zone2", "server2").unwrap();
        assert_eq!(s2.attrs.internal, Endpoint::new("10.0.0.2", 9000));
        assert_eq!(
            s2.attrs.external,
            Some(Endpoint::new("192.168.0.2", 9000))
        );
        assert!(desired.server("pool1", "zone2", "server3").is_some());
    }

    #[test]
    fn test_parse_flat_topo_example() {
        let text = r#"{
            "servers": [
                {"name": "server1", "internalip": "127.0.0.1", "internalport": 16701,
                 "externalip": "127.0.0.1", "externalport": 16701, "zone": "zone1", "pool": "pool1"},
                {"name": "server2", "internalip": "127.0.0.1", "internalport": 16702,
                 "externalip": "127.0.0.1", "externalport": 16702, "zone": "zone2", "pool": "pool1"},
                {"name": "server3", "internalip": "127.0.0.1", "internalport": 16703,
                 "externalip": "127.0.0.1", "externalport": 16703, "zone": "zone3", "pool": "pool1"}
            ],
            "pools": [
                {"name": "pool1", "replicasnum": 3, "copysetnum": 100, "zonenum": 3}
            ]
        }"#;
        let desired = parse_document(text, &strict()).unwrap();
        assert_eq!(desired.zones_in("pool1").count(), 3);
        assert_eq!(
            desired.server("pool1", "zone2", "server2").unwrap().attrs.internal,
            Endpoint::new("127.0.0.1", 16702)
        );
    }

    #[test]
    fn test_duplicate_object_keys_are_rejected() {
        let text = r#"{"pools": {
            "p1": {"zones": {"z1": [{"name": "s1", "internal": "10.0.0.1:1"}]}},
            "p1": {"zones": {"z2": [{"name": "s2", "internal": "10.0.0.2:1"}]}}
        }}"#;
        let err = parse_document(text, &strict()).unwrap_err();
        assert_eq!(
            err,
            ValidationError::DuplicateKey {
                scope: "pools".to_string(),
                key: "/p1".to_string()
            }
        );

        let text = r#"{"pools": {"p1": {"zones": {
            "z1": [{"name": "s1", "internal": "10.0.0.1:1"}],
            "z1": []
        }}}}"#;
        assert!(matches!(
            parse_document(text, &strict()),
            Err(ValidationError::DuplicateKey { .. })
        ));
    }

    #[test]
    fn test_duplicate_server_in_zone() {
        let text = r#"{"pools": {"p1": {"zones": {"z1": [
            {"name": "s1", "internal": "10.0.0.1:1"},
            {"name": "s1", "internal": "10.0.0.2:1"}
        ]}}}}"#;
        let err = parse_document(text, &strict()).unwrap_err();
        assert_eq!(
            err,
            ValidationError::DuplicateKey {
                scope: "zone '/p1/z1'".to_string(),
                key: "/p1/z1/s1".to_string()
            }
        );
    }

    #[test]
    fn test_missing_fields() {
        let text = r#"{"pools": {"p1": {"zones": {"z1": [{"name": "s1"}]}}}}"#;
        assert!(matches!(
            parse_document(text, &strict()),
            Err(ValidationError::MissingField { field: "internal", .. })
        ));

        let text = r#"{"pools": [{"name": "p1"}], "servers": [
            {"name": "s1", "internalip": "10.0.0.1", "internalport": 1, "pool": "p1"}
        ]}"#;
        assert!(matches!(
            parse_document(text, &strict()),
            Err(ValidationError::MissingField { field: "zone", .. })
        ));
    }

    #[test]
    fn test_dangling_references() {
        let text = r#"{"pools": [{"name": "p1"}], "servers": [
            {"name": "s1", "internalip": "10.0.0.1", "internalport": 1, "zone": "z1", "pool": "p2"}
        ]}"#;
        assert!(matches!(
            parse_document(text, &strict()),
            Err(ValidationError::DanglingReference { .. })
        ));

        let text = r#"{"pools": [{"name": "p1"}, {"name": "p2"}], "servers": [
            {"name": "s1", "internalip": "10.0.0.1", "internalport": 1, "zone": "z1", "pool": "p1"}
        ]}"#;
        assert_eq!(
            parse_document(text, &strict()).unwrap_err(),
            ValidationError::DanglingPool {
                pool: "p2".to_string()
            }
        );

        let text = r#"{"pools": {"p1": {"replicas": 3}}}"#;
        assert!(matches!(
            parse_document(text, &strict()),
            Err(ValidationError::DanglingPool { .. })
        ));
    }

    #[test]
    fn test_malformed_shapes() {
        for text in [
            "[]",
            "not json",
            r#"{"pools": 3}"#,
            r#"{"pools": {"p1": {"zones": {"z1": {"name": "s1"}}}}}"#,
            r#"{"pools": {"p1": {"zones": {"z1": []}}}, "servers": []}"#,
        ] {
            assert!(
                matches!(
                    parse_document(text, &strict()),
                    Err(ValidationError::Malformed(_))
                ),
                "expected malformed for {}",
                text
            );
        }
    }

    #[test]
    fn test_invalid_names_and_endpoints() {
        let text = r#"{"pools": {"p/1": {"zones": {"z1": []}}}}"#;
        assert!(matches!(
            parse_document(text, &strict()),
            Err(ValidationError::InvalidName { .. })
        ));

        let text = r#"{"pools": {"p1": {"zones": {"z1": [{"name": "s1", "internal": "10.0.0.1"}]}}}}"#;
        assert!(matches!(
            parse_document(text, &strict()),
            Err(ValidationError::InvalidEndpoint { .. })
        ));
    }

    #[test]
    fn test_empty_document_depends_on_options() {
        for text in ["{}", r#"{"pools": {}}"#, r#"{"pools": [], "servers": []}"#] {
            assert_eq!(
                parse_document(text, &strict()).unwrap_err(),
                ValidationError::EmptyTopology
            );
            let desired = parse_document(text, &ParseOptions { allow_empty: true }).unwrap();
            assert!(desired.is_empty());
        }
    }

    #[test]
    fn test_round_trip() {
        let desired = parse_document(NESTED, &strict()).unwrap();
        let text = TopologyDocument::from_graph(&desired).to_json_pretty();
        let reparsed = parse_document(&text, &strict()).unwrap();

        assert_eq!(reparsed, desired);
        let keys: Vec<EntityKey> = reparsed.keys();
        assert_eq!(keys, desired.keys());
        assert_eq!(keys.len(), 2 + 3 + 3);
    }

    #[test]
    fn test_random_round_trip() {
        use crate::diff::tests::random_graph;
        use rand::rngs::StdRng;
        use rand::SeedableRng;

        let options = ParseOptions { allow_empty: true };
        for seed in 0..100 {
            let mut rng = StdRng::seed_from_u64(seed);
            let graph = random_graph(&mut rng);
            let text = TopologyDocument::from_graph(&graph).to_json_pretty();
            let reparsed = parse_document(&text, &options).unwrap();
            assert_eq!(*reparsed.graph(), graph, "seed {}", seed);
        }
    }
}
