//! REST clients for the center and edge APIs

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::offload::{CenterApi, OffloadStatus};
use crate::{
    Edge, EdgeId, LoadLevel, Metrics, PATH_BALANCER_OFFLOAD, PATH_BALANCER_STATUS,
    PATH_BALANCER_STOP, PATH_EDGES, PATH_EDGE_METRICS,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

fn build_client() -> Result<Client> {
    Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(REQUEST_TIMEOUT)
        .build()
        .context("Failed to build HTTP client")
}

fn parse_base(base_url: &str) -> Result<Url> {
    let url = Url::parse(base_url).with_context(|| format!("Invalid base URL: {base_url}"))?;
    if url.cannot_be_a_base() {
        anyhow::bail!("Not a base URL: {base_url}");
    }
    Ok(url)
}

/// `base` with `path` appended, keeping any path prefix of `base`
fn join(base: &Url, path: &str) -> Url {
    let mut url = base.clone();
    let prefix = base.path().trim_end_matches('/');
    url.set_path(&format!("{prefix}{path}"));
    url
}

#[derive(Deserialize)]
struct EdgesResponse {
    edges: Vec<Edge>,
}

/// Client for the center's listing and balancer endpoints
#[derive(Clone)]
pub struct HttpCenterApi {
    client: Client,
    base: Url,
}

impl HttpCenterApi {
    pub fn new(base_url: &str) -> Result<Self> {
        Ok(Self {
            client: build_client()?,
            base: parse_base(base_url)?,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn stop_url(&self, source: &EdgeId) -> Result<Url> {
        let mut url = join(&self.base, PATH_BALANCER_STOP);
        url.path_segments_mut()
            .map_err(|_| anyhow!("Not a base URL: {}", self.base))?
            .push(source.as_str());
        Ok(url)
    }
}

#[async_trait::async_trait]
impl CenterApi for HttpCenterApi {
    async fn list_edges(&self) -> Result<Vec<Edge>> {
        let response: EdgesResponse = self
            .client
            .get(join(&self.base, PATH_EDGES))
            .send()
            .await
            .context("Edge listing request failed")?
            .error_for_status()
            .context("Edge listing returned error status")?
            .json()
            .await
            .context("Invalid edge listing")?;
        Ok(response.edges)
    }

    async fn offload_status(&self) -> Result<OffloadStatus> {
        self.client
            .get(join(&self.base, PATH_BALANCER_STATUS))
            .send()
            .await
            .context("Balancer status request failed")?
            .error_for_status()
            .context("Balancer status returned error status")?
            .json()
            .await
            .context("Invalid balancer status")
    }

    async fn start_offload(&self, source: &EdgeId, target: &EdgeId) -> Result<()> {
        debug!(source = %source, target = %target, "POST offload");
        self.client
            .post(join(&self.base, PATH_BALANCER_OFFLOAD))
            .query(&[("source_edge", source.as_str()), ("target_edge", target.as_str())])
            .send()
            .await
            .context("Offload request failed")?
            .error_for_status()
            .context("Offload returned error status")?;
        Ok(())
    }

    async fn stop_offload(&self, source: &EdgeId) -> Result<()> {
        debug!(source = %source, "POST stop offload");
        self.client
            .post(self.stop_url(source)?)
            .send()
            .await
            .context("Stop offload request failed")?
            .error_for_status()
            .context("Stop offload returned error status")?;
        Ok(())
    }
}

/// Body of the edge metrics endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeMetricsReport {
    pub metrics: Metrics,
    /// The edge's own classification, when it reports one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_level: Option<LoadLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub should_offload: Option<bool>,
}

impl EdgeMetricsReport {
    /// Reported level, or one computed from the metrics
    pub fn load_level(&self) -> LoadLevel {
        self.load_level.unwrap_or_else(|| self.metrics.load_level())
    }
}

/// Client for one edge's metrics endpoint
#[derive(Clone)]
pub struct HttpEdgeApi {
    client: Client,
    base: Url,
}

impl HttpEdgeApi {
    pub fn new(base_url: &str) -> Result<Self> {
        Ok(Self {
            client: build_client()?,
            base: parse_base(base_url)?,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    pub async fn metrics(&self) -> Result<EdgeMetricsReport> {
        self.client
            .get(join(&self.base, PATH_EDGE_METRICS))
            .send()
            .await
            .context("Metrics request failed")?
            .error_for_status()
            .context("Metrics returned error status")?
            .json()
            .await
            .context("Invalid metrics response")
    }
}
