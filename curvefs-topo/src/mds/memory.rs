//! In-memory model of the MDS topology service.
//!
//! `MemoryMds` enforces the same contract as the real service (see
//! [`super::wire`]) and can inject faults per method and key. The mock server
//! crate serves it over HTTP; unit tests use it directly as a transport.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::wire::{
    ListTopologyResponse, MutationRequest, MutationResponse, PoolInfo, ServerInfo, ServiceCode,
    ZoneInfo,
};
use super::{MdsError, MdsTransport};
use crate::topology::{EntityKey, GraphError, Pool, Server, TopologyGraph, Zone};

/// A scripted failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Answer with this status code without touching the topology.
    Code(ServiceCode),
    /// Fail the connection.
    Unreachable,
    /// Apply the request, then lose the response.
    LostResponse,
    /// Hold the request this long before handling it.
    Delay(Duration),
}

/// When a [`Fault`] fires.
#[derive(Debug, Clone)]
pub struct FaultRule {
    method: Option<String>,
    key: Option<EntityKey>,
    fault: Fault,
    remaining: Option<usize>,
}

impl FaultRule {
    /// Fire on every call to `method`.
    pub fn on(method: &str, fault: Fault) -> Self {
        Self {
            method: Some(method.to_string()),
            key: None,
            fault,
            remaining: None,
        }
    }

    /// Fire on every call.
    pub fn always(fault: Fault) -> Self {
        Self {
            method: None,
            key: None,
            fault,
            remaining: None,
        }
    }

    /// Only for requests targeting `key`.
    pub fn key(mut self, key: EntityKey) -> Self {
        self.key = Some(key);
        self
    }

    /// Fire at most `n` times.
    pub fn times(mut self, n: usize) -> Self {
        self.remaining = Some(n);
        self
    }

    fn matches(&self, method: &str, key: Option<&EntityKey>) -> bool {
        self.remaining != Some(0)
            && self.method.as_deref().map_or(true, |m| m == method)
            && self.key.as_ref().map_or(true, |k| Some(k) == key)
    }
}

/// A request seen by the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub endpoint: String,
    pub method: String,
    pub key: Option<EntityKey>,
    pub request_id: Option<String>,
}

#[derive(Default)]
struct Inner {
    graph: TopologyGraph,
    faults: Vec<FaultRule>,
    unreachable: HashSet<String>,
    leader: Option<String>,
    calls: Vec<RecordedCall>,
}

#[derive(Default)]
pub struct MemoryMds {
    inner: Mutex<Inner>,
}

impl MemoryMds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_graph(graph: TopologyGraph) -> Self {
        let mds = Self::new();
        mds.lock().graph = graph;
        mds
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current topology.
    pub fn graph(&self) -> TopologyGraph {
        self.lock().graph.clone()
    }

    /// Replace the stored topology, as another actor would.
    pub fn set_graph(&self, graph: TopologyGraph) {
        self.lock().graph = graph;
    }

    pub fn inject(&self, rule: FaultRule) {
        self.lock().faults.push(rule);
    }

    pub fn clear_faults(&self) {
        self.lock().faults.clear();
    }

    /// Refuse connections on `endpoint`.
    pub fn set_unreachable(&self, endpoint: &str) {
        self.lock().unreachable.insert(endpoint.to_string());
    }

    /// Answer `NotLeader` on every endpoint except `endpoint`.
    pub fn set_leader(&self, endpoint: &str) {
        self.lock().leader = Some(endpoint.to_string());
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.lock().calls.clone()
    }

    /// Calls to `method`, in arrival order.
    pub fn calls_to(&self, method: &str) -> Vec<RecordedCall> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.method == method)
            .cloned()
            .collect()
    }

    /// Serve `ListTopology`.
    pub fn handle_list(&self) -> ListTopologyResponse {
        let inner = self.lock();
        ListTopologyResponse {
            status_code: ServiceCode::Ok.code(),
            message: None,
            pools: inner.graph.pools().map(PoolInfo::from).collect(),
            zones: inner.graph.zones().map(ZoneInfo::from).collect(),
            servers: inner.graph.servers().map(ServerInfo::from).collect(),
        }
    }

    /// Serve one mutation.
    pub fn handle(&self, request: &MutationRequest) -> MutationResponse {
        let mut inner = self.lock();
        let graph = &mut inner.graph;
        let result = match request {
            MutationRequest::CreatePool { pool, .. } => create_pool(graph, Pool::from(pool)),
            MutationRequest::CreateZone { zone, .. } => create_zone(graph, Zone::from(zone)),
            MutationRequest::CreateServer { server, .. } => {
                server_from(server).and_then(|s| create_server(graph, s))
            }
            MutationRequest::UpdateServer {
                expected, server, ..
            } => server_from(expected)
                .and_then(|e| server_from(server).map(|s| (e, s)))
                .and_then(|(e, s)| update_server(graph, e, s)),
            MutationRequest::DeleteServer { expected, .. } => {
                server_from(expected).and_then(|e| delete_server(graph, e))
            }
            MutationRequest::DeleteZone { zone, .. } => delete_zone(graph, Zone::from(zone)),
            MutationRequest::DeletePool { expected, .. } => {
                delete_pool(graph, Pool::from(expected))
            }
        };
        let response = match result {
            Ok(()) => MutationResponse::ok(),
            Err((code, message)) => MutationResponse::new(code, message),
        };
        debug!(
            method = request.method(),
            request_id = request.request_id(),
            code = %response.code(),
            "Handled topology mutation"
        );
        response
    }

    /// Record the call and pick the fault to apply, if any.
    fn admit(
        &self,
        endpoint: &str,
        method: &str,
        key: Option<EntityKey>,
        request_id: Option<&str>,
    ) -> Result<Option<Fault>, MdsError> {
        let mut inner = self.lock();
        inner.calls.push(RecordedCall {
            endpoint: endpoint.to_string(),
            method: method.to_string(),
            key: key.clone(),
            request_id: request_id.map(str::to_string),
        });

        if inner.unreachable.contains(endpoint) {
            return Err(MdsError::Unreachable {
                endpoint: endpoint.to_string(),
                message: "connection refused".to_string(),
            });
        }
        if let Some(leader) = &inner.leader {
            if leader != endpoint {
                return Ok(Some(Fault::Code(ServiceCode::NotLeader)));
            }
        }

        let fault = inner
            .faults
            .iter_mut()
            .find(|rule| rule.matches(method, key.as_ref()))
            .map(|rule| {
                if let Some(n) = rule.remaining.as_mut() {
                    *n -= 1;
                }
                rule.fault.clone()
            });
        Ok(fault)
    }
}

#[async_trait]
impl MdsTransport for MemoryMds {
    async fn list_topology(&self, endpoint: &str) -> Result<ListTopologyResponse, MdsError> {
        match self.admit(endpoint, super::wire::LIST_TOPOLOGY, None, None)? {
            None => Ok(self.handle_list()),
            Some(Fault::Code(code)) => Ok(ListTopologyResponse {
                status_code: code.code(),
                message: Some("injected".to_string()),
                ..Default::default()
            }),
            Some(Fault::Unreachable) => Err(unreachable(endpoint)),
            Some(Fault::LostResponse) => Err(lost(endpoint)),
            Some(Fault::Delay(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(self.handle_list())
            }
        }
    }

    async fn mutate(
        &self,
        endpoint: &str,
        request: &MutationRequest,
    ) -> Result<MutationResponse, MdsError> {
        let key = request_key(request);
        match self.admit(endpoint, request.method(), Some(key), Some(request.request_id()))? {
            None => Ok(self.handle(request)),
            Some(Fault::Code(code)) => Ok(MutationResponse::new(code, "injected")),
            Some(Fault::Unreachable) => Err(unreachable(endpoint)),
            Some(Fault::LostResponse) => {
                self.handle(request);
                Err(lost(endpoint))
            }
            Some(Fault::Delay(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(self.handle(request))
            }
        }
    }
}

fn unreachable(endpoint: &str) -> MdsError {
    MdsError::Unreachable {
        endpoint: endpoint.to_string(),
        message: "injected".to_string(),
    }
}

fn lost(endpoint: &str) -> MdsError {
    MdsError::Timeout {
        endpoint: endpoint.to_string(),
        after: Duration::ZERO,
    }
}

/// Entity targeted by a mutation.
pub fn request_key(request: &MutationRequest) -> EntityKey {
    match request {
        MutationRequest::CreatePool { pool, .. } => EntityKey::Pool(pool.pool_name.clone()),
        MutationRequest::DeletePool { expected, .. } => {
            EntityKey::Pool(expected.pool_name.clone())
        }
        MutationRequest::CreateZone { zone, .. } | MutationRequest::DeleteZone { zone, .. } => {
            EntityKey::Zone(zone.pool_name.clone(), zone.zone_name.clone())
        }
        MutationRequest::CreateServer { server, .. }
        | MutationRequest::UpdateServer { server, .. }
        | MutationRequest::DeleteServer {
            expected: server, ..
        } => EntityKey::Server(
            server.pool_name.clone(),
            server.zone_name.clone(),
            server.server_name.clone(),
        ),
    }
}

type Outcome = Result<(), (ServiceCode, String)>;

fn server_from(info: &ServerInfo) -> Result<Server, (ServiceCode, String)> {
    Server::try_from(info).map_err(|e| (ServiceCode::InvalidParam, e))
}

fn from_graph_error(e: GraphError) -> (ServiceCode, String) {
    let code = match &e {
        GraphError::Duplicate(_) => ServiceCode::AlreadyExists,
        GraphError::MissingParent { .. } | GraphError::NotFound(_) => ServiceCode::NotFound,
        GraphError::HasChildren(_) => ServiceCode::HasChildren,
    };
    (code, e.to_string())
}

fn differs(key: &EntityKey) -> (ServiceCode, String) {
    (
        ServiceCode::PreconditionFailed,
        format!("{} differs from the expected entity", key),
    )
}

fn create_pool(graph: &mut TopologyGraph, pool: Pool) -> Outcome {
    if let Some(existing) = graph.pool(&pool.name) {
        if existing.attrs != pool.attrs {
            return Err(differs(&pool.key()));
        }
    }
    graph.insert_pool(pool).map_err(from_graph_error)
}

fn create_zone(graph: &mut TopologyGraph, zone: Zone) -> Outcome {
    graph.insert_zone(zone).map_err(from_graph_error)
}

fn create_server(graph: &mut TopologyGraph, server: Server) -> Outcome {
    if let Some(existing) = graph.server(&server.pool, &server.zone, &server.name) {
        if existing.attrs != server.attrs {
            return Err(differs(&server.key()));
        }
    }
    graph.insert_server(server).map_err(from_graph_error)
}

fn update_server(graph: &mut TopologyGraph, expected: Server, server: Server) -> Outcome {
    if expected.key() != server.key() {
        return Err((
            ServiceCode::InvalidParam,
            format!("expected {} but updating {}", expected.key(), server.key()),
        ));
    }
    let stored = graph
        .server(&server.pool, &server.zone, &server.name)
        .ok_or_else(|| from_graph_error(GraphError::NotFound(server.key())))?;
    if *stored == server {
        return Ok(());
    }
    if *stored != expected {
        return Err(differs(&server.key()));
    }
    graph.replace_server(server).map(|_| ()).map_err(from_graph_error)
}

fn delete_server(graph: &mut TopologyGraph, expected: Server) -> Outcome {
    let stored = graph
        .server(&expected.pool, &expected.zone, &expected.name)
        .ok_or_else(|| from_graph_error(GraphError::NotFound(expected.key())))?;
    if *stored != expected {
        return Err(differs(&expected.key()));
    }
    graph
        .remove_server(&expected.pool, &expected.zone, &expected.name)
        .map(|_| ())
        .map_err(from_graph_error)
}

fn delete_zone(graph: &mut TopologyGraph, zone: Zone) -> Outcome {
    graph
        .remove_zone(&zone.pool, &zone.name)
        .map(|_| ())
        .map_err(from_graph_error)
}

fn delete_pool(graph: &mut TopologyGraph, expected: Pool) -> Outcome {
    let stored = graph
        .pool(&expected.name)
        .ok_or_else(|| from_graph_error(GraphError::NotFound(expected.key())))?;
    if stored.attrs != expected.attrs {
        return Err(differs(&expected.key()));
    }
    graph
        .remove_pool(&expected.name)
        .map(|_| ())
        .map_err(from_graph_error)
}
