//! Topology differencer.
//!
//! Compares the desired and live graphs by key and produces the ordered
//! [`ChangeSet`] that converges live onto desired.

use std::fmt;

use serde::Serialize;

use crate::topology::{
    DesiredState, Endpoint, EntityKey, LiveState, Pool, PoolAttrs, Server, Zone,
};

/// Operation groups in application order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum OperationKind {
    CreatePool,
    CreateZone,
    CreateServer,
    UpdateServer,
    DeleteServer,
    DeleteZone,
    DeletePool,
}

impl OperationKind {
    pub fn is_create(self) -> bool {
        matches!(
            self,
            OperationKind::CreatePool | OperationKind::CreateZone | OperationKind::CreateServer
        )
    }

    pub fn is_delete(self) -> bool {
        matches!(
            self,
            OperationKind::DeleteServer | OperationKind::DeleteZone | OperationKind::DeletePool
        )
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One topology mutation.
///
/// Creates carry the desired entity. Updates and deletes carry the live
/// entity they expect to find, which the MDS checks as a precondition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Operation {
    CreatePool(Pool),
    CreateZone(Zone),
    CreateServer(Server),
    UpdateServer { current: Server, desired: Server },
    DeleteServer(Server),
    DeleteZone(Zone),
    DeletePool(Pool),
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::CreatePool(_) => OperationKind::CreatePool,
            Operation::CreateZone(_) => OperationKind::CreateZone,
            Operation::CreateServer(_) => OperationKind::CreateServer,
            Operation::UpdateServer { .. } => OperationKind::UpdateServer,
            Operation::DeleteServer(_) => OperationKind::DeleteServer,
            Operation::DeleteZone(_) => OperationKind::DeleteZone,
            Operation::DeletePool(_) => OperationKind::DeletePool,
        }
    }

    pub fn key(&self) -> EntityKey {
        match self {
            Operation::CreatePool(pool) | Operation::DeletePool(pool) => pool.key(),
            Operation::CreateZone(zone) | Operation::DeleteZone(zone) => zone.key(),
            Operation::CreateServer(server) | Operation::DeleteServer(server) => server.key(),
            Operation::UpdateServer { desired, .. } => desired.key(),
        }
    }

    /// Total order used for the change set: group precedence, then key.
    fn sort_key(&self) -> (OperationKind, EntityKey) {
        (self.kind(), self.key())
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind(), self.key())?;
        if let Operation::UpdateServer { current, desired } = self {
            if current.attrs.internal != desired.attrs.internal {
                write!(f, " internal {} -> {}", current.attrs.internal, desired.attrs.internal)?;
            }
            if current.attrs.external != desired.attrs.external {
                let show = |e: &Option<Endpoint>| match e {
                    Some(ep) => format!("{}", ep),
                    None => "-".to_string(),
                };
                write!(
                    f,
                    " external {} -> {}",
                    show(&current.attrs.external),
                    show(&desired.attrs.external)
                )?;
            }
        }
        Ok(())
    }
}

/// A pool whose attributes differ between desired and live state.
///
/// The MDS fixes a pool's layout at creation, so drift is reported rather
/// than applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolDrift {
    pub pool: String,
    pub desired: PoolAttrs,
    pub live: PoolAttrs,
}

impl fmt::Display for PoolDrift {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pool {}: desired replicas={} copysets={}, live replicas={} copysets={}",
            self.pool,
            self.desired.replicas,
            self.desired.copysets,
            self.live.replicas,
            self.live.copysets
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChangeSet {
    pub operations: Vec<Operation>,
    pub drift: Vec<PoolDrift>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Operation> {
        self.operations.iter()
    }
}

/// Compute the operations that turn `live` into `desired`.
pub fn diff(desired: &DesiredState, live: &LiveState) -> ChangeSet {
    let mut operations = Vec::new();
    let mut drift = Vec::new();

    for pool in desired.pools() {
        match live.pool(&pool.name) {
            None => operations.push(Operation::CreatePool(pool.clone())),
            Some(existing) if existing.attrs != pool.attrs => drift.push(PoolDrift {
                pool: pool.name.clone(),
                desired: pool.attrs,
                live: existing.attrs,
            }),
            Some(_) => {}
        }
    }
    for zone in desired.zones() {
        if live.zone(&zone.pool, &zone.name).is_none() {
            operations.push(Operation::CreateZone(zone.clone()));
        }
    }
    for server in desired.servers() {
        match live.server(&server.pool, &server.zone, &server.name) {
            None => operations.push(Operation::CreateServer(server.clone())),
            Some(current) if current.attrs != server.attrs => {
                operations.push(Operation::UpdateServer {
                    current: current.clone(),
                    desired: server.clone(),
                })
            }
            Some(_) => {}
        }
    }

    for server in live.servers() {
        if desired
            .server(&server.pool, &server.zone, &server.name)
            .is_none()
        {
            operations.push(Operation::DeleteServer(server.clone()));
        }
    }
    for zone in live.zones() {
        if desired.zone(&zone.pool, &zone.name).is_none() {
            operations.push(Operation::DeleteZone(zone.clone()));
        }
    }
    for pool in live.pools() {
        if desired.pool(&pool.name).is_none() {
            operations.push(Operation::DeletePool(pool.clone()));
        }
    }

    // Group precedence, then ascending key.
    operations.sort_by_key(Operation::sort_key);

    ChangeSet { operations, drift }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::topology::{ServerAttrs, TopologyGraph};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    pub(crate) fn graph(layout: &[(&str, &[(&str, &[(&str, &str)])])]) -> TopologyGraph {
        let mut graph = TopologyGraph::new();
        for (pool, zones) in layout {
            graph
                .insert_pool(Pool {
                    name: pool.to_string(),
                    attrs: PoolAttrs::default(),
                })
                .unwrap();
            for (zone, servers) in *zones {
                graph
                    .insert_zone(Zone {
                        pool: pool.to_string(),
                        name: zone.to_string(),
                    })
                    .unwrap();
                for (name, endpoint) in *servers {
                    graph
                        .insert_server(Server {
                            pool: pool.to_string(),
                            zone: zone.to_string(),
                            name: name.to_string(),
                            attrs: ServerAttrs {
                                internal: endpoint.parse().unwrap(),
                                external: None,
                            },
                        })
                        .unwrap();
                }
            }
        }
        graph
    }

    /// Random topology drawn from a small name space so that two draws overlap.
    pub(crate) fn random_graph(rng: &mut StdRng) -> TopologyGraph {
        let mut graph = TopologyGraph::new();
        for p in 0..rng.gen_range(0..4) {
            let pool = format!("pool{}", p);
            let zones = rng.gen_range(1..4);
            graph
                .insert_pool(Pool {
                    name: pool.clone(),
                    attrs: PoolAttrs {
                        replicas: 3,
                        copysets: if rng.gen_bool(0.1) { 50 } else { 100 },
                    },
                })
                .unwrap();
            for z in 0..zones {
                let zone = format!("zone{}", z);
                graph
                    .insert_zone(Zone {
                        pool: pool.clone(),
                        name: zone.clone(),
                    })
                    .unwrap();
                for s in 0..rng.gen_range(0..4) {
                    graph
                        .insert_server(Server {
                            pool: pool.clone(),
                            zone: zone.clone(),
                            name: format!("server{}", s),
                            attrs: ServerAttrs {
                                internal: Endpoint::new(
                                    format!("10.0.{}.{}", p, z * 10 + s),
                                    9000 + rng.gen_range(0..2),
                                ),
                                external: None,
                            },
                        })
                        .unwrap();
                }
            }
        }
        graph
    }

    fn summary(changes: &ChangeSet) -> Vec<String> {
        changes
            .iter()
            .map(|op| format!("{} {}", op.kind(), op.key()))
            .collect()
    }

    #[test]
    fn test_create_from_empty() {
        let desired = DesiredState::new(graph(&[("p1", &[("z1", &[("s1", "10.0.0.1:9000")])])]));
        let changes = diff(&desired, &LiveState::default());

        assert_eq!(
            summary(&changes),
            vec!["CreatePool /p1", "CreateZone /p1/z1", "CreateServer /p1/z1/s1"]
        );
        assert!(changes.drift.is_empty());
    }

    #[test]
    fn test_delete_to_empty() {
        let live = LiveState::new(graph(&[("p1", &[("z1", &[("s1", "10.0.0.1:9000")])])]));
        let changes = diff(&DesiredState::default(), &live);

        assert_eq!(
            summary(&changes),
            vec!["DeleteServer /p1/z1/s1", "DeleteZone /p1/z1", "DeletePool /p1"]
        );
    }

    #[test]
    fn test_identical_states_produce_no_operations() {
        let g = graph(&[
            ("p1", &[("z1", &[("s1", "10.0.0.1:9000")]), ("z2", &[])]),
            ("p2", &[("z1", &[("s1", "10.0.1.1:9000")])]),
        ]);
        let changes = diff(&DesiredState::new(g.clone()), &LiveState::new(g));
        assert!(changes.is_empty());
        assert!(changes.drift.is_empty());
    }

    #[test]
    fn test_endpoint_change_is_an_update() {
        let desired = DesiredState::new(graph(&[("p1", &[("z1", &[("s1", "10.0.0.9:9000")])])]));
        let live = LiveState::new(graph(&[("p1", &[("z1", &[("s1", "10.0.0.1:9000")])])]));
        let changes = diff(&desired, &live);

        assert_eq!(changes.len(), 1);
        match &changes.operations[0] {
            Operation::UpdateServer { current, desired } => {
                assert_eq!(current.attrs.internal.host, "10.0.0.1");
                assert_eq!(desired.attrs.internal.host, "10.0.0.9");
            }
            other => panic!("unexpected operation {:?}", other),
        }
        assert_eq!(
            changes.operations[0].to_string(),
            "UpdateServer /p1/z1/s1 internal 10.0.0.1:9000 -> 10.0.0.9:9000"
        );
    }

    #[test]
    fn test_pool_attribute_change_is_drift() {
        let desired = graph(&[("p1", &[("z1", &[])])]);
        let mut live = TopologyGraph::new();
        live.insert_pool(Pool {
            name: "p1".to_string(),
            attrs: PoolAttrs {
                replicas: 1,
                copysets: 100,
            },
        })
        .unwrap();
        live.insert_zone(Zone {
            pool: "p1".to_string(),
            name: "z1".to_string(),
        })
        .unwrap();

        let changes = diff(&DesiredState::new(desired), &LiveState::new(live));
        assert!(changes.is_empty());
        assert_eq!(changes.drift.len(), 1);
        assert_eq!(changes.drift[0].live.replicas, 1);
        assert_eq!(changes.drift[0].desired.replicas, 3);
    }

    #[test]
    fn test_mixed_changes_follow_group_precedence() {
        let desired = DesiredState::new(graph(&[
            ("a", &[("z1", &[("s1", "10.0.0.1:9000"), ("s2", "10.0.0.2:9000")])]),
            ("c", &[("z1", &[("s1", "10.0.2.1:9000")])]),
        ]));
        let live = LiveState::new(graph(&[
            ("a", &[("z1", &[("s1", "10.0.0.1:9001")]), ("z9", &[("s1", "10.0.9.1:9000")])]),
            ("b", &[("z1", &[])]),
        ]));

        assert_eq!(
            summary(&diff(&desired, &live)),
            vec![
                "CreatePool /c",
                "CreateZone /c/z1",
                "CreateServer /a/z1/s2",
                "CreateServer /c/z1/s1",
                "UpdateServer /a/z1/s1",
                "DeleteServer /a/z9/s1",
                "DeleteZone /a/z9",
                "DeleteZone /b/z1",
                "DeletePool /b",
            ]
        );
    }

    #[test]
    fn test_ordering_property_on_random_pairs() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..200 {
            let desired = DesiredState::new(random_graph(&mut rng));
            let live = LiveState::new(random_graph(&mut rng));
            let changes = diff(&desired, &live);

            for (i, op) in changes.iter().enumerate() {
                for later in &changes.operations[i + 1..] {
                    assert!(op.sort_key() <= later.sort_key());
                    // A child is never created before its parent or deleted after it.
                    if op.kind().is_create() && later.kind().is_create() {
                        assert!(!later.key().is_ancestor_of(&op.key()));
                    }
                    if op.kind().is_delete() && later.kind().is_delete() {
                        assert!(!op.key().is_ancestor_of(&later.key()));
                    }
                }
            }

            let same = diff(&desired, &LiveState::new(desired.graph().clone()));
            assert!(same.is_empty());
        }
    }
}
