//! HTTP/JSON transport.
//!
//! brpc exposes every protobuf method at `POST /<Service>/<Method>` with a JSON
//! body, so the topology service is reachable without generated stubs.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use super::wire::{self, ListTopologyResponse, MutationRequest, MutationResponse};
use super::{MdsError, MdsTransport};

pub struct HttpTransport {
    client: reqwest::Client,
    connect_timeout: Duration,
}

impl HttpTransport {
    pub fn new(connect_timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self {
            client,
            connect_timeout,
        })
    }

    async fn post<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        method: &str,
        body: &Value,
    ) -> Result<T, MdsError> {
        let url = format!("http://{}/{}/{}", endpoint, wire::SERVICE_NAME, method);
        debug!("POST {}", url);

        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| self.send_error(endpoint, e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(MdsError::Protocol(format!(
                "{} answered HTTP {}: {}",
                url, status, text
            )));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| MdsError::Protocol(format!("invalid response from {}: {}", url, e)))
    }

    fn send_error(&self, endpoint: &str, e: reqwest::Error) -> MdsError {
        if e.is_timeout() {
            MdsError::Timeout {
                endpoint: endpoint.to_string(),
                after: self.connect_timeout,
            }
        } else {
            MdsError::Unreachable {
                endpoint: endpoint.to_string(),
                message: e.to_string(),
            }
        }
    }
}

#[async_trait]
impl MdsTransport for HttpTransport {
    async fn list_topology(&self, endpoint: &str) -> Result<ListTopologyResponse, MdsError> {
        self.post(endpoint, wire::LIST_TOPOLOGY, &Value::Object(Default::default()))
            .await
    }

    async fn mutate(
        &self,
        endpoint: &str,
        request: &MutationRequest,
    ) -> Result<MutationResponse, MdsError> {
        let body = request
            .body()
            .map_err(|e| MdsError::Protocol(format!("cannot encode {}: {}", request.method(), e)))?;
        self.post(endpoint, request.method(), &body).await
    }
}
