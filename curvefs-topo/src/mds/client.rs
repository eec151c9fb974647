//! MDS client adapter.
//!
//! Adds per-call deadlines, bounded retries, leader failover and
//! idempotent mutation semantics on top of a raw [`MdsTransport`].

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::wire::{MutationRequest, MutationResponse, PoolInfo, ServerInfo, ServiceCode, ZoneInfo};
use super::{MdsError, MdsTransport};
use crate::config::MdsConfig;
use crate::diff::Operation;
use crate::report::OperationResult;
use crate::topology::{LiveState, Pool, Server, TopologyGraph, Zone};

pub struct MdsClient {
    transport: Arc<dyn MdsTransport>,
    config: MdsConfig,
    /// Index into `config.addrs` of the MDS currently believed to lead.
    current: AtomicUsize,
}

impl MdsClient {
    pub fn new(transport: Arc<dyn MdsTransport>, config: MdsConfig) -> Self {
        Self {
            transport,
            config,
            current: AtomicUsize::new(0),
        }
    }

    fn endpoint(&self) -> (usize, String) {
        let index = self.current.load(Ordering::Acquire);
        let addr = self
            .config
            .addrs
            .get(index)
            .or_else(|| self.config.addrs.first())
            .cloned()
            .unwrap_or_default();
        (index, addr)
    }

    /// Move to the next address unless another caller already did.
    fn failover(&self, from: usize) {
        let len = self.config.addrs.len();
        if len < 2 {
            return;
        }
        let next = (from + 1) % len;
        if self
            .current
            .compare_exchange(from, next, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            info!(
                "Switching mds from {} to {}",
                self.config.addrs[from], self.config.addrs[next]
            );
        }
    }

    /// Run `call` with a deadline per attempt, retrying transient errors.
    async fn with_retries<T, F, Fut>(&self, what: &str, call: F) -> Result<T, MdsError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, MdsError>>,
    {
        if self.config.addrs.is_empty() {
            return Err(MdsError::Unreachable {
                endpoint: String::new(),
                message: "no mds address configured".to_string(),
            });
        }

        let attempts = self.config.retry.max_retries + 1;
        let mut attempt = 1;
        loop {
            let (index, endpoint) = self.endpoint();
            let result = match timeout(self.config.rpc_timeout, call(endpoint.clone())).await {
                Ok(result) => result,
                Err(_) => Err(MdsError::Timeout {
                    endpoint: endpoint.clone(),
                    after: self.config.rpc_timeout,
                }),
            };

            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if err.should_failover() {
                self.failover(index);
            }
            if !err.is_transient() || attempt >= attempts {
                return Err(err);
            }

            let delay = self.config.retry.delay(attempt);
            warn!(
                "{} failed on {} (attempt {}/{}): {}, retrying in {:?}",
                what, endpoint, attempt, attempts, err, delay
            );
            sleep(delay).await;
            attempt += 1;
        }
    }

    /// Fetch the live topology snapshot.
    pub async fn fetch_topology(&self) -> Result<LiveState, MdsError> {
        let response = self
            .with_retries("ListTopology", |endpoint| {
                let transport = Arc::clone(&self.transport);
                async move {
                    let response = transport.list_topology(&endpoint).await?;
                    let code = ServiceCode::from_code(response.status_code);
                    if code.is_ok() {
                        Ok(response)
                    } else {
                        Err(MdsError::Service {
                            code,
                            message: response.message.unwrap_or_default(),
                        })
                    }
                }
            })
            .await?;

        let mut graph = TopologyGraph::new();
        for pool in &response.pools {
            graph.insert_pool(Pool::from(pool)).map_err(inconsistent)?;
        }
        for zone in &response.zones {
            graph.insert_zone(Zone::from(zone)).map_err(inconsistent)?;
        }
        for server in &response.servers {
            let server = Server::try_from(server).map_err(MdsError::InconsistentTopology)?;
            graph.insert_server(server).map_err(inconsistent)?;
        }

        debug!(
            pools = response.pools.len(),
            zones = response.zones.len(),
            servers = response.servers.len(),
            "Fetched live topology"
        );
        Ok(LiveState::new(graph))
    }

    /// Submit one operation.
    ///
    /// Retried creates that find their entity already present and deletes
    /// that find it already gone count as succeeded.
    pub async fn apply_operation(&self, op: &Operation) -> OperationResult {
        let request = to_request(op, Uuid::new_v4().to_string());
        let result = self
            .with_retries(request.method(), |endpoint| {
                let transport = Arc::clone(&self.transport);
                let request = request.clone();
                async move {
                    let response = transport.mutate(&endpoint, &request).await?;
                    let code = response.code();
                    if code.is_transient() {
                        return Err(MdsError::Service {
                            code,
                            message: response.message.unwrap_or_default(),
                        });
                    }
                    Ok(response)
                }
            })
            .await;

        match result {
            Ok(response) => interpret(op, response),
            Err(err) => OperationResult::Failed(err),
        }
    }
}

fn inconsistent(e: crate::topology::GraphError) -> MdsError {
    MdsError::InconsistentTopology(e.to_string())
}

fn to_request(op: &Operation, request_id: String) -> MutationRequest {
    match op {
        Operation::CreatePool(pool) => MutationRequest::CreatePool {
            request_id,
            pool: PoolInfo::from(pool),
        },
        Operation::CreateZone(zone) => MutationRequest::CreateZone {
            request_id,
            zone: ZoneInfo::from(zone),
        },
        Operation::CreateServer(server) => MutationRequest::CreateServer {
            request_id,
            server: ServerInfo::from(server),
        },
        Operation::UpdateServer { current, desired } => MutationRequest::UpdateServer {
            request_id,
            expected: ServerInfo::from(current),
            server: ServerInfo::from(desired),
        },
        Operation::DeleteServer(server) => MutationRequest::DeleteServer {
            request_id,
            expected: ServerInfo::from(server),
        },
        Operation::DeleteZone(zone) => MutationRequest::DeleteZone {
            request_id,
            zone: ZoneInfo::from(zone),
        },
        Operation::DeletePool(pool) => MutationRequest::DeletePool {
            request_id,
            expected: PoolInfo::from(pool),
        },
    }
}

fn interpret(op: &Operation, response: MutationResponse) -> OperationResult {
    let code = response.code();
    let message = response.message.unwrap_or_default();
    let kind = op.kind();

    match code {
        ServiceCode::Ok => OperationResult::Succeeded,
        ServiceCode::AlreadyExists if kind.is_create() => {
            debug!("{} already exists, nothing to do", op.key());
            OperationResult::Succeeded
        }
        ServiceCode::NotFound if kind.is_delete() => {
            debug!("{} already removed, nothing to do", op.key());
            OperationResult::Succeeded
        }
        ServiceCode::PreconditionFailed | ServiceCode::HasChildren => {
            OperationResult::Failed(MdsError::Conflict {
                key: op.key().to_string(),
                message: if message.is_empty() {
                    code.to_string()
                } else {
                    message
                },
            })
        }
        ServiceCode::NotFound if !kind.is_create() => OperationResult::Failed(MdsError::Conflict {
            key: op.key().to_string(),
            message: "entity disappeared since the live snapshot".to_string(),
        }),
        code => OperationResult::Failed(MdsError::Service { code, message }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Backoff, RetryPolicy};
    use crate::diff::tests::graph;
    use crate::mds::memory::{Fault, FaultRule};
    use crate::mds::MemoryMds;
    use crate::topology::{PoolAttrs, ServerAttrs};
    use std::time::Duration;
    use tokio::time::Instant;

    fn config(addrs: &[&str]) -> MdsConfig {
        MdsConfig {
            addrs: addrs.iter().map(|a| a.to_string()).collect(),
            rpc_timeout: Duration::from_millis(500),
            retry: RetryPolicy {
                max_retries: 3,
                interval: Duration::from_millis(100),
                max_interval: Duration::from_secs(2),
                backoff: Backoff::Exponential,
            },
        }
    }

    fn client(mds: &Arc<MemoryMds>, addrs: &[&str]) -> MdsClient {
        MdsClient::new(mds.clone(), config(addrs))
    }

    fn create_pool(name: &str) -> Operation {
        Operation::CreatePool(Pool {
            name: name.to_string(),
            attrs: PoolAttrs::default(),
        })
    }

    fn server(ip: &str) -> Server {
        Server {
            pool: "p1".to_string(),
            zone: "z1".to_string(),
            name: "s1".to_string(),
            attrs: ServerAttrs {
                internal: format!("{}:9000", ip).parse().unwrap(),
                external: None,
            },
        }
    }

    #[tokio::test]
    async fn test_fetch_topology() {
        let g = graph(&[("p1", &[("z1", &[("s1", "10.0.0.1:9000")])])]);
        let mds = Arc::new(MemoryMds::with_graph(g.clone()));
        let live = client(&mds, &["mds-a"]).fetch_topology().await.unwrap();
        assert_eq!(live.graph(), &g);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried_with_backoff() {
        let mds = Arc::new(MemoryMds::new());
        mds.inject(FaultRule::on("CreatePool", Fault::Unreachable).times(2));
        let start = Instant::now();

        let result = client(&mds, &["mds-a"]).apply_operation(&create_pool("p1")).await;

        assert_eq!(result, OperationResult::Succeeded);
        assert_eq!(mds.calls_to("CreatePool").len(), 3);
        // 100ms + 200ms of backoff.
        assert_eq!(start.elapsed(), Duration::from_millis(300));
        // One request id across all attempts.
        let ids: Vec<_> = mds
            .calls_to("CreatePool")
            .into_iter()
            .map(|c| c.request_id)
            .collect();
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_is_bounded() {
        let mds = Arc::new(MemoryMds::new());
        mds.inject(FaultRule::on("CreatePool", Fault::Code(ServiceCode::Busy)));

        let result = client(&mds, &["mds-a"]).apply_operation(&create_pool("p1")).await;

        assert!(matches!(
            result,
            OperationResult::Failed(MdsError::Service {
                code: ServiceCode::Busy,
                ..
            })
        ));
        assert_eq!(mds.calls_to("CreatePool").len(), 4);
    }

    #[tokio::test]
    async fn test_non_transient_errors_are_not_retried() {
        let mds = Arc::new(MemoryMds::new());
        mds.inject(FaultRule::on("CreatePool", Fault::Code(ServiceCode::InternalError)));

        let result = client(&mds, &["mds-a"]).apply_operation(&create_pool("p1")).await;

        assert!(matches!(
            result,
            OperationResult::Failed(MdsError::Service {
                code: ServiceCode::InternalError,
                ..
            })
        ));
        assert_eq!(mds.calls_to("CreatePool").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_cancels_the_call() {
        let mds = Arc::new(MemoryMds::new());
        mds.inject(FaultRule::on("CreatePool", Fault::Delay(Duration::from_secs(60))));
        let mut cfg = config(&["mds-a"]);
        cfg.retry = RetryPolicy::none();
        let client = MdsClient::new(mds.clone(), cfg);

        let result = client.apply_operation(&create_pool("p1")).await;

        assert!(matches!(
            result,
            OperationResult::Failed(MdsError::Timeout { after, .. })
                if after == Duration::from_millis(500)
        ));
        // The cancelled call never reached the model.
        assert!(mds.graph().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_response_is_idempotent() {
        let mds = Arc::new(MemoryMds::new());
        mds.inject(FaultRule::on("CreatePool", Fault::LostResponse).times(1));
        mds.inject(FaultRule::on("DeletePool", Fault::LostResponse).times(1));
        let client = client(&mds, &["mds-a"]);

        // The retry sees AlreadyExists.
        assert_eq!(
            client.apply_operation(&create_pool("p1")).await,
            OperationResult::Succeeded
        );
        assert!(mds.graph().pool("p1").is_some());

        // The retry sees NotFound.
        let delete = Operation::DeletePool(Pool {
            name: "p1".to_string(),
            attrs: PoolAttrs::default(),
        });
        assert_eq!(client.apply_operation(&delete).await, OperationResult::Succeeded);
        assert!(mds.graph().is_empty());
    }

    #[tokio::test]
    async fn test_precondition_mismatch_is_a_conflict() {
        let mds = Arc::new(MemoryMds::with_graph(graph(&[(
            "p1",
            &[("z1", &[("s1", "10.0.0.5:9000")])],
        )])));
        let update = Operation::UpdateServer {
            current: server("10.0.0.1"),
            desired: server("10.0.0.2"),
        };

        let result = client(&mds, &["mds-a"]).apply_operation(&update).await;

        match result {
            OperationResult::Failed(err) => assert!(err.is_conflict()),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(mds.calls_to("UpdateServer").len(), 1);
        assert_eq!(
            mds.graph().server("p1", "z1", "s1").unwrap().attrs.internal.host,
            "10.0.0.5"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failover_to_leader() {
        let mds = Arc::new(MemoryMds::new());
        mds.set_unreachable("mds-a");
        mds.set_leader("mds-c");
        let client = client(&mds, &["mds-a", "mds-b", "mds-c"]);

        assert_eq!(
            client.apply_operation(&create_pool("p1")).await,
            OperationResult::Succeeded
        );
        let endpoints: Vec<String> = mds.calls().into_iter().map(|c| c.endpoint).collect();
        assert_eq!(endpoints, vec!["mds-a", "mds-b", "mds-c"]);

        // Later calls stay on the leader.
        client.fetch_topology().await.unwrap();
        assert_eq!(mds.calls().last().unwrap().endpoint, "mds-c");
    }

    #[tokio::test]
    async fn test_fetch_rejects_inconsistent_snapshot() {
        struct Broken;

        #[async_trait::async_trait]
        impl MdsTransport for Broken {
            async fn list_topology(
                &self,
                _endpoint: &str,
            ) -> Result<crate::mds::wire::ListTopologyResponse, MdsError> {
                Ok(crate::mds::wire::ListTopologyResponse {
                    zones: vec![ZoneInfo {
                        zone_name: "z1".to_string(),
                        pool_name: "missing".to_string(),
                    }],
                    ..Default::default()
                })
            }

            async fn mutate(
                &self,
                _endpoint: &str,
                _request: &MutationRequest,
            ) -> Result<MutationResponse, MdsError> {
                Ok(MutationResponse::ok())
            }
        }

        let client = MdsClient::new(Arc::new(Broken), config(&["mds-a"]));
        assert!(matches!(
            client.fetch_topology().await,
            Err(MdsError::InconsistentTopology(_))
        ));
    }
}
