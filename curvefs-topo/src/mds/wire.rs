//! JSON messages of the MDS topology service.
//!
//! Every method is served at `POST /TopologyService/<Method>`. Responses carry a
//! `statusCode`; zero is success.
//!
//! Service contract relied on by the client:
//! - creating an entity whose key already exists with the same attributes
//!   answers `AlreadyExists`, with different attributes `PreconditionFailed`;
//! - updates and deletes carry the expected stored entity and answer
//!   `PreconditionFailed` when it differs (an update already in effect is `Ok`);
//! - deleting a zone or pool that still has children answers `HasChildren`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::topology::{Endpoint, Pool, PoolAttrs, Server, ServerAttrs, Zone};

pub const SERVICE_NAME: &str = "TopologyService";
pub const LIST_TOPOLOGY: &str = "ListTopology";

/// Status codes returned by the topology service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i32", from = "i32")]
pub enum ServiceCode {
    Ok,
    InternalError,
    InvalidParam,
    NotFound,
    AlreadyExists,
    PreconditionFailed,
    HasChildren,
    NotLeader,
    Busy,
    Other(i32),
}

impl ServiceCode {
    pub fn code(self) -> i32 {
        match self {
            ServiceCode::Ok => 0,
            ServiceCode::InternalError => -1,
            ServiceCode::InvalidParam => -2,
            ServiceCode::NotFound => -5,
            ServiceCode::AlreadyExists => -6,
            ServiceCode::PreconditionFailed => -7,
            ServiceCode::HasChildren => -8,
            ServiceCode::NotLeader => -9,
            ServiceCode::Busy => -10,
            ServiceCode::Other(code) => code,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            0 => ServiceCode::Ok,
            -1 => ServiceCode::InternalError,
            -2 => ServiceCode::InvalidParam,
            -5 => ServiceCode::NotFound,
            -6 => ServiceCode::AlreadyExists,
            -7 => ServiceCode::PreconditionFailed,
            -8 => ServiceCode::HasChildren,
            -9 => ServiceCode::NotLeader,
            -10 => ServiceCode::Busy,
            other => ServiceCode::Other(other),
        }
    }

    /// Codes worth retrying against the same or another MDS.
    pub fn is_transient(self) -> bool {
        matches!(self, ServiceCode::NotLeader | ServiceCode::Busy)
    }

    pub fn is_ok(self) -> bool {
        self == ServiceCode::Ok
    }
}

impl From<i32> for ServiceCode {
    fn from(code: i32) -> Self {
        ServiceCode::from_code(code)
    }
}

impl From<ServiceCode> for i32 {
    fn from(code: ServiceCode) -> Self {
        code.code()
    }
}

impl std::fmt::Display for ServiceCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceCode::Other(code) => write!(f, "code {}", code),
            known => write!(f, "{:?} ({})", known, known.code()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolInfo {
    pub pool_name: String,
    pub replicas_num: u32,
    pub copyset_num: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneInfo {
    pub zone_name: String,
    pub pool_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub server_name: String,
    pub zone_name: String,
    pub pool_name: String,
    pub internal_ip: String,
    pub internal_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_port: Option<u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListTopologyResponse {
    pub status_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub pools: Vec<PoolInfo>,
    #[serde(default)]
    pub zones: Vec<ZoneInfo>,
    #[serde(default)]
    pub servers: Vec<ServerInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationResponse {
    pub status_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl MutationResponse {
    pub fn new(code: ServiceCode, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            status_code: code.code(),
            message: (!message.is_empty()).then_some(message),
        }
    }

    pub fn ok() -> Self {
        Self::new(ServiceCode::Ok, "")
    }

    pub fn code(&self) -> ServiceCode {
        ServiceCode::from_code(self.status_code)
    }
}

/// Topology mutations. The variant name is the RPC method name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "request")]
#[serde(rename_all_fields = "camelCase")]
pub enum MutationRequest {
    CreatePool {
        request_id: String,
        pool: PoolInfo,
    },
    CreateZone {
        request_id: String,
        zone: ZoneInfo,
    },
    CreateServer {
        request_id: String,
        server: ServerInfo,
    },
    UpdateServer {
        request_id: String,
        expected: ServerInfo,
        server: ServerInfo,
    },
    DeleteServer {
        request_id: String,
        expected: ServerInfo,
    },
    DeleteZone {
        request_id: String,
        zone: ZoneInfo,
    },
    DeletePool {
        request_id: String,
        expected: PoolInfo,
    },
}

impl MutationRequest {
    pub fn method(&self) -> &'static str {
        match self {
            MutationRequest::CreatePool { .. } => "CreatePool",
            MutationRequest::CreateZone { .. } => "CreateZone",
            MutationRequest::CreateServer { .. } => "CreateServer",
            MutationRequest::UpdateServer { .. } => "UpdateServer",
            MutationRequest::DeleteServer { .. } => "DeleteServer",
            MutationRequest::DeleteZone { .. } => "DeleteZone",
            MutationRequest::DeletePool { .. } => "DeletePool",
        }
    }

    pub fn request_id(&self) -> &str {
        match self {
            MutationRequest::CreatePool { request_id, .. }
            | MutationRequest::CreateZone { request_id, .. }
            | MutationRequest::CreateServer { request_id, .. }
            | MutationRequest::UpdateServer { request_id, .. }
            | MutationRequest::DeleteServer { request_id, .. }
            | MutationRequest::DeleteZone { request_id, .. }
            | MutationRequest::DeletePool { request_id, .. } => request_id,
        }
    }

    /// JSON body sent to `/TopologyService/<method>`.
    pub fn body(&self) -> serde_json::Result<Value> {
        let mut tagged = serde_json::to_value(self)?;
        Ok(tagged
            .get_mut("request")
            .map(Value::take)
            .unwrap_or(Value::Null))
    }

    /// Rebuild a request from its method name and JSON body.
    pub fn decode(method: &str, body: Value) -> serde_json::Result<Self> {
        serde_json::from_value(json!({ "method": method, "request": body }))
    }
}

impl From<&Pool> for PoolInfo {
    fn from(pool: &Pool) -> Self {
        Self {
            pool_name: pool.name.clone(),
            replicas_num: pool.attrs.replicas,
            copyset_num: pool.attrs.copysets,
        }
    }
}

impl From<&PoolInfo> for Pool {
    fn from(info: &PoolInfo) -> Self {
        Self {
            name: info.pool_name.clone(),
            attrs: PoolAttrs {
                replicas: info.replicas_num,
                copysets: info.copyset_num,
            },
        }
    }
}

impl From<&Zone> for ZoneInfo {
    fn from(zone: &Zone) -> Self {
        Self {
            zone_name: zone.name.clone(),
            pool_name: zone.pool.clone(),
        }
    }
}

impl From<&ZoneInfo> for Zone {
    fn from(info: &ZoneInfo) -> Self {
        Self {
            pool: info.pool_name.clone(),
            name: info.zone_name.clone(),
        }
    }
}

impl From<&Server> for ServerInfo {
    fn from(server: &Server) -> Self {
        Self {
            server_name: server.name.clone(),
            zone_name: server.zone.clone(),
            pool_name: server.pool.clone(),
            internal_ip: server.attrs.internal.host.clone(),
            internal_port: server.attrs.internal.port,
            external_ip: server.attrs.external.as_ref().map(|e| e.host.clone()),
            external_port: server.attrs.external.as_ref().map(|e| e.port),
        }
    }
}

impl TryFrom<&ServerInfo> for Server {
    type Error = String;

    fn try_from(info: &ServerInfo) -> Result<Self, Self::Error> {
        let external = match (&info.external_ip, info.external_port) {
            (Some(ip), Some(port)) => Some(Endpoint::new(ip.clone(), port)),
            (None, None) => None,
            _ => {
                return Err(format!(
                    "server {} has a partial external endpoint",
                    info.server_name
                ))
            }
        };
        Ok(Self {
            pool: info.pool_name.clone(),
            zone: info.zone_name.clone(),
            name: info.server_name.clone(),
            attrs: ServerAttrs {
                internal: Endpoint::new(info.internal_ip.clone(), info.internal_port),
                external,
            },
        })
    }
}
