//! Access to the MDS topology service.
//!
//! ```text
//! Reconciler / Executor → MdsClient (retries, deadlines, idempotence)
//!                              ↓
//!                        Arc<dyn MdsTransport>
//!                         ├── HttpTransport   (brpc HTTP/JSON)
//!                         └── MemoryMds       (in-memory model)
//! ```

pub mod client;
pub mod http;
pub mod memory;
pub mod wire;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

pub use client::MdsClient;
pub use http::HttpTransport;
pub use memory::MemoryMds;
pub use wire::ServiceCode;

/// Errors talking to the MDS.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
pub enum MdsError {
    /// Connection could not be established.
    #[error("mds {endpoint} unreachable: {message}")]
    Unreachable { endpoint: String, message: String },

    /// The call exceeded its deadline and was cancelled.
    #[error("rpc to mds {endpoint} timed out after {}ms", .after.as_millis())]
    Timeout { endpoint: String, after: Duration },

    /// The service answered with a failure status.
    #[error("mds returned {code}: {message}")]
    Service { code: ServiceCode, message: String },

    /// The stored entity changed since the live snapshot was taken.
    #[error("conflict on {key}: {message}")]
    Conflict { key: String, message: String },

    /// The fetched topology violates referential integrity.
    #[error("inconsistent topology from mds: {0}")]
    InconsistentTopology(String),

    /// The response could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl MdsError {
    /// Errors the client retries.
    pub fn is_transient(&self) -> bool {
        match self {
            MdsError::Unreachable { .. } | MdsError::Timeout { .. } => true,
            MdsError::Service { code, .. } => code.is_transient(),
            _ => false,
        }
    }

    /// Errors after which the next attempt should go to another MDS.
    pub fn should_failover(&self) -> bool {
        matches!(
            self,
            MdsError::Unreachable { .. }
                | MdsError::Service {
                    code: ServiceCode::NotLeader,
                    ..
                }
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, MdsError::Conflict { .. })
    }
}

/// Delivers topology RPCs to one MDS endpoint.
///
/// Implementations report transport failures as `Unreachable`/`Protocol`;
/// service status codes are returned in the response for the client to judge.
#[async_trait]
pub trait MdsTransport: Send + Sync {
    async fn list_topology(&self, endpoint: &str) -> Result<wire::ListTopologyResponse, MdsError>;

    async fn mutate(
        &self,
        endpoint: &str,
        request: &wire::MutationRequest,
    ) -> Result<wire::MutationResponse, MdsError>;
}
