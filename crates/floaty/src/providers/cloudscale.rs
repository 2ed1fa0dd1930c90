//! Cloudscale floating IP provider.
//!
//! Refreshing sets the floating IP's next hop to the configured server. The
//! server UUID comes from the configuration, from a hostname lookup table or
//! from the OpenStack metadata endpoint, in that order.

use super::{Provider, Refresher, USER_AGENT};
use crate::address::NetAddress;
use crate::backoff::{metadata_backoff, retry, RetryError};
use async_trait::async_trait;
use common::{Error, Result};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::{Uuid, Variant};

const DEFAULT_ENDPOINT: &str = "https://api.cloudscale.ch/v1";
const METADATA_URL: &str = "http://169.254.169.254/openstack/latest/meta_data.json";
const METADATA_MAX_ELAPSED: Duration = Duration::from_secs(10);

/// The `cloudscale` section of the configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct CloudscaleConfig {
    pub endpoint: Option<String>,
    pub token: String,
    pub server_uuid: Option<Uuid>,
    pub hostname_to_server_uuid: HashMap<String, Uuid>,
}

#[derive(Debug)]
pub struct CloudscaleProvider {
    client: reqwest::Client,
    endpoint: String,
    server_uuid: Uuid,
    http_timeout: Duration,
}

impl CloudscaleProvider {
    pub async fn new(cfg: &CloudscaleConfig, http_timeout: Duration) -> Result<Self> {
        if cfg.token.is_empty() {
            return Err(Error::config("Authentication token required"));
        }

        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {}", cfg.token))
            .map_err(|_| Error::config("Invalid characters in authentication token"))?;
        headers.insert(AUTHORIZATION, bearer);

        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .timeout(http_timeout)
            .build()
            .map_err(|err| Error::provider(err.to_string()))?;

        let endpoint = cfg
            .endpoint
            .clone()
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string())
            .trim_end_matches('/')
            .to_string();

        let server_uuid = resolve_server_uuid(cfg, &client).await?;

        if server_uuid.is_nil() {
            return Err(Error::config("Server UUID is required"));
        }
        match server_uuid.get_variant() {
            Variant::RFC4122 | Variant::Microsoft => {}
            _ => return Err(Error::config(format!("Invalid UUID {server_uuid:?}"))),
        }

        debug!(server_uuid = %server_uuid, "Cloudscale server UUID resolved");

        Ok(Self {
            client,
            endpoint,
            server_uuid,
            http_timeout,
        })
    }
}

/// Server UUID from config, hostname map or the metadata service.
async fn resolve_server_uuid(cfg: &CloudscaleConfig, client: &reqwest::Client) -> Result<Uuid> {
    if let Some(uuid) = cfg.server_uuid {
        return Ok(uuid);
    }

    let hostname = nix::unistd::gethostname()
        .map_err(|err| Error::config(format!("Retrieving hostname: {err}")))?;
    let hostname = hostname.to_string_lossy().into_owned();

    if let Some(uuid) = cfg.hostname_to_server_uuid.get(&hostname) {
        return Ok(*uuid);
    }

    warn!(
        hostname = %hostname,
        "Server UUID not configured for hostname, querying metadata service"
    );

    match fetch_metadata_uuid(client).await {
        Ok(uuid) => Ok(uuid),
        Err(err) => Err(Error::config(format!(
            "Server UUID not found for hostname {hostname:?}: {err}"
        ))),
    }
}

#[derive(Debug, Deserialize)]
struct ServerMetadata {
    #[serde(default)]
    meta: ServerMetadataMeta,
}

#[derive(Debug, Default, Deserialize)]
struct ServerMetadataMeta {
    cloudscale_uuid: Option<Uuid>,
}

async fn fetch_metadata_uuid(client: &reqwest::Client) -> Result<Uuid> {
    retry(metadata_backoff(METADATA_MAX_ELAPSED), || async move {
        let response = client
            .get(METADATA_URL)
            .send()
            .await
            .map_err(|err| RetryError::transient(Error::provider(err.to_string())))?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(
                status,
                Error::api(status.as_u16(), "Metadata request failed"),
            ));
        }

        let metadata: ServerMetadata = response
            .json()
            .await
            .map_err(|err| RetryError::permanent(Error::provider(err.to_string())))?;

        metadata.meta.cloudscale_uuid.ok_or_else(|| {
            RetryError::permanent(Error::provider("Metadata contains no server UUID"))
        })
    })
    .await
}

#[async_trait]
impl Provider for CloudscaleProvider {
    async fn test(&self) -> Result<()> {
        let url = format!("{}/floating-ips", self.endpoint);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|err| Error::provider(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::api(status.as_u16(), "Listing floating IPs failed"));
        }

        Ok(())
    }

    async fn new_refresher(&self, address: NetAddress) -> Result<Box<dyn Refresher>> {
        Ok(Box::new(CloudscaleRefresher {
            client: self.client.clone(),
            endpoint: self.endpoint.clone(),
            server_uuid: self.server_uuid,
            http_timeout: self.http_timeout,
            address,
        }))
    }
}

#[derive(Debug, Serialize)]
struct FloatingIpUpdateRequest {
    server: Uuid,
}

struct CloudscaleRefresher {
    client: reqwest::Client,
    endpoint: String,
    server_uuid: Uuid,
    http_timeout: Duration,
    address: NetAddress,
}

#[async_trait]
impl Refresher for CloudscaleRefresher {
    async fn refresh(&self) -> std::result::Result<(), RetryError> {
        let ip = self.address.ip();
        let url = format!("{}/floating-ips/{ip}", self.endpoint);

        info!(address = %ip, server = %self.server_uuid, "Set next-hop of address");

        let request = self
            .client
            .patch(&url)
            .json(&FloatingIpUpdateRequest {
                server: self.server_uuid,
            })
            .send();

        // Give slightly more time than the underlying HTTP timeout
        let deadline = self.http_timeout + request_headroom(self.http_timeout);

        let response = match tokio::time::timeout(deadline, request).await {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                return Err(RetryError::transient(Error::provider(format!(
                    "Setting next-hop of address {ip} failed: {err}"
                ))));
            }
            Err(_) => {
                return Err(RetryError::transient(Error::provider(format!(
                    "Setting next-hop of address {ip} timed out"
                ))));
            }
        };

        let status = response.status();
        if status.is_success() {
            debug!(address = %ip, "Refresh successful");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_status(
            status,
            Error::api(
                status.as_u16(),
                format!("Setting next-hop of address {ip} failed: {body}"),
            ),
        ))
    }

    fn describe(&self) -> String {
        self.address.to_string()
    }
}

/// Extra request headroom beyond the HTTP timeout: a tenth of the timeout,
/// clamped between two and ten seconds.
fn request_headroom(timeout: Duration) -> Duration {
    Duration::from_secs((timeout.as_secs_f64() / 10.0).clamp(2.0, 10.0) as u64)
}

pub(crate) fn classify_status(status: StatusCode, err: Error) -> RetryError {
    if status.is_client_error() {
        RetryError::permanent(err)
    } else {
        RetryError::transient(err)
    }
}
