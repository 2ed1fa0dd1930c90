//! Exoscale elastic IP provider.
//!
//! Zone and instance ID come from the configuration, falling back to the
//! cloud metadata service. Each refresher is bound to the elastic IP object
//! whose address matches the managed address; refreshing attaches the
//! elastic IP to this instance and detaches it from any other instance in
//! the zone that still holds it.

use super::cloudscale::classify_status;
use super::{Provider, Refresher, USER_AGENT};
use crate::address::NetAddress;
use crate::backoff::{metadata_backoff, retry, RetryError};
use async_trait::async_trait;
use common::{Error, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, info};

const METADATA_ENDPOINT: &str = "http://169.254.169.254/latest";
const METADATA_MAX_ELAPSED: Duration = Duration::from_secs(5);
const OPERATION_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// The `exoscale` section of the configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct ExoscaleConfig {
    pub endpoint: Option<String>,
    pub zone: Option<String>,
    pub key: String,
    pub secret: String,
    pub instance_id: Option<String>,
}

#[derive(Debug)]
pub struct ExoscaleProvider {
    api: ApiClient,
    instance_id: String,
}

impl ExoscaleProvider {
    pub async fn new(cfg: &ExoscaleConfig, http_timeout: Duration) -> Result<Self> {
        if cfg.key.is_empty() {
            return Err(Error::config("Authentication key required"));
        }
        if cfg.secret.is_empty() {
            return Err(Error::config("Authentication secret required"));
        }

        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(http_timeout)
            .build()
            .map_err(|err| Error::provider(err.to_string()))?;

        let zone = match &cfg.zone {
            Some(zone) => zone.clone(),
            None => fetch_metadata(&client, "availability-zone").await?,
        };

        let instance_id = match &cfg.instance_id {
            Some(id) => id.clone(),
            None => {
                let id = fetch_metadata(&client, "instance-id").await?;
                if id.is_empty() {
                    return Err(Error::provider("Received empty instance ID"));
                }
                id
            }
        };

        debug!(zone = %zone, instance_id = %instance_id, "Exoscale instance discovered");

        let endpoint = cfg
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("https://api-{zone}.exoscale.com/v2"))
            .trim_end_matches('/')
            .to_string();

        let api = ApiClient {
            client,
            endpoint,
            key: cfg.key.clone(),
            secret: cfg.secret.clone(),
        };

        Ok(Self { api, instance_id })
    }
}

async fn fetch_metadata(client: &reqwest::Client, path: &str) -> Result<String> {
    let url = format!("{METADATA_ENDPOINT}/{path}");
    let url = url.as_str();

    retry(metadata_backoff(METADATA_MAX_ELAPSED), || async move {
        let response = client
            .get(url)
            .send()
            .await
            .map_err(|err| RetryError::transient(Error::provider(err.to_string())))?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(
                status,
                Error::api(status.as_u16(), format!("Metadata lookup of {path} failed")),
            ));
        }

        response
            .text()
            .await
            .map(|text| text.trim().to_string())
            .map_err(|err| RetryError::transient(Error::provider(err.to_string())))
    })
    .await
}

#[async_trait]
impl Provider for ExoscaleProvider {
    async fn test(&self) -> Result<()> {
        self.api
            .list_elastic_ips()
            .await
            .map_err(RetryError::into_inner)?;
        Ok(())
    }

    async fn new_refresher(&self, address: NetAddress) -> Result<Box<dyn Refresher>> {
        let elastic_ips = self
            .api
            .list_elastic_ips()
            .await
            .map_err(RetryError::into_inner)?;

        let elastic_ip = elastic_ips
            .into_iter()
            .find(|eip| eip.ip == address.ip())
            .ok_or_else(|| {
                Error::provider(format!("No elastic IP found for address {address}"))
            })?;

        debug!(id = %elastic_ip.id, address = %address, "Elastic IP discovered");

        Ok(Box::new(ExoscaleRefresher {
            api: self.api.clone(),
            instance_id: self.instance_id.clone(),
            elastic_ip_id: elastic_ip.id,
            address,
        }))
    }
}

struct ExoscaleRefresher {
    api: ApiClient,
    instance_id: String,
    elastic_ip_id: String,
    address: NetAddress,
}

#[async_trait]
impl Refresher for ExoscaleRefresher {
    async fn refresh(&self) -> std::result::Result<(), RetryError> {
        info!(
            address = %self.address,
            instance = %self.instance_id,
            "Attaching elastic IP to this instance"
        );

        // Always force the attachment to the desired target first
        let operation = self
            .api
            .attach_elastic_ip(&self.elastic_ip_id, &self.instance_id)
            .await?;
        self.api.wait_operation(&operation).await?;

        // Then strip the address from every other holder in the zone
        let mut detach_errors = Vec::new();
        let mut detach_total = 0;

        for instance in self.api.list_instances().await? {
            if instance.id == self.instance_id {
                continue;
            }

            let details = match self.api.get_instance(&instance.id).await {
                Ok(details) => details,
                Err(err) => {
                    detach_total += 1;
                    detach_errors.push(err);
                    continue;
                }
            };

            let holds_address = details
                .elastic_ips
                .iter()
                .any(|eip| eip.id == self.elastic_ip_id);
            if !holds_address {
                continue;
            }

            info!(
                address = %self.address,
                instance = %details.id,
                "Detaching elastic IP from other instance"
            );

            detach_total += 1;
            let result = async {
                let operation = self
                    .api
                    .detach_elastic_ip(&self.elastic_ip_id, &details.id)
                    .await?;
                self.api.wait_operation(&operation).await
            }
            .await;

            if let Err(err) = result {
                detach_errors.push(err);
            }
        }

        if detach_errors.is_empty() {
            return Ok(());
        }

        // Error details have been logged by the API client
        let combined = Error::provider(format!(
            "{} of {} detach commands failed",
            detach_errors.len(),
            detach_total
        ));

        if detach_errors.iter().all(RetryError::is_permanent) {
            Err(RetryError::Permanent(combined))
        } else {
            Err(RetryError::Transient(combined))
        }
    }

    fn describe(&self) -> String {
        self.address.to_string()
    }
}

#[derive(Clone)]
#[derive(Debug)]
struct ApiClient {
    client: reqwest::Client,
    endpoint: String,
    key: String,
    secret: String,
}

#[derive(Debug, Deserialize)]
struct ElasticIp {
    id: String,
    ip: IpAddr,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ElasticIpList {
    #[serde(default)]
    elastic_ips: Vec<ElasticIp>,
}

#[derive(Debug, Deserialize)]
struct InstanceRef {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct InstanceList {
    #[serde(default)]
    instances: Vec<InstanceRef>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct Instance {
    id: String,
    #[serde(default)]
    elastic_ips: Vec<ElasticIp>,
}

#[derive(Debug, Deserialize)]
struct Operation {
    id: String,
    state: String,
}

#[derive(Debug, Serialize)]
struct AttachmentRequest<'a> {
    instance: InstanceId<'a>,
}

#[derive(Debug, Serialize)]
struct InstanceId<'a> {
    id: &'a str,
}

impl ApiClient {
    async fn list_elastic_ips(&self) -> std::result::Result<Vec<ElasticIp>, RetryError> {
        let list: ElasticIpList = self.get("elastic-ip").await?;
        Ok(list.elastic_ips)
    }

    async fn list_instances(&self) -> std::result::Result<Vec<InstanceRef>, RetryError> {
        let list: InstanceList = self.get("instance").await?;
        Ok(list.instances)
    }

    async fn get_instance(&self, id: &str) -> std::result::Result<Instance, RetryError> {
        self.get(&format!("instance/{id}")).await
    }

    async fn attach_elastic_ip(
        &self,
        elastic_ip_id: &str,
        instance_id: &str,
    ) -> std::result::Result<Operation, RetryError> {
        self.put(
            &format!("elastic-ip/{elastic_ip_id}:attach"),
            &AttachmentRequest {
                instance: InstanceId { id: instance_id },
            },
        )
        .await
    }

    async fn detach_elastic_ip(
        &self,
        elastic_ip_id: &str,
        instance_id: &str,
    ) -> std::result::Result<Operation, RetryError> {
        self.put(
            &format!("elastic-ip/{elastic_ip_id}:detach"),
            &AttachmentRequest {
                instance: InstanceId { id: instance_id },
            },
        )
        .await
    }

    /// Poll an operation until it has reached a final state.
    async fn wait_operation(&self, operation: &Operation) -> std::result::Result<(), RetryError> {
        let mut current_state = operation.state.clone();

        loop {
            match current_state.as_str() {
                "success" => return Ok(()),
                "failure" | "timeout" => {
                    return Err(RetryError::transient(Error::provider(format!(
                        "Operation {} ended in state {current_state:?}",
                        operation.id
                    ))));
                }
                _ => {
                    tokio::time::sleep(OPERATION_POLL_INTERVAL).await;
                    let refreshed: Operation =
                        self.get(&format!("operation/{}", operation.id)).await?;
                    current_state = refreshed.state;
                }
            }
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> std::result::Result<T, RetryError> {
        let request = self
            .client
            .get(format!("{}/{path}", self.endpoint))
            .basic_auth(&self.key, Some(&self.secret));
        Self::execute(path, request).await
    }

    async fn put<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &impl Serialize,
    ) -> std::result::Result<T, RetryError> {
        let request = self
            .client
            .put(format!("{}/{path}", self.endpoint))
            .basic_auth(&self.key, Some(&self.secret))
            .json(body);
        Self::execute(path, request).await
    }

    async fn execute<T: DeserializeOwned>(
        path: &str,
        request: reqwest::RequestBuilder,
    ) -> std::result::Result<T, RetryError> {
        let response = request.send().await.map_err(|err| {
            RetryError::transient(Error::provider(format!("Request {path:?} failed: {err}")))
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(path = %path, status = status.as_u16(), body = %body, "API request failed");
            return Err(classify_status(
                status,
                Error::api(status.as_u16(), format!("Request {path:?} failed")),
            ));
        }

        response.json().await.map_err(|err| {
            RetryError::permanent(Error::provider(format!(
                "Malformed response for {path:?}: {err}"
            )))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_credentials_are_rejected() {
        let cfg = ExoscaleConfig {
            zone: Some("ch-gva-2".to_string()),
            instance_id: Some("instance".to_string()),
            ..ExoscaleConfig::default()
        };

        let err = ExoscaleProvider::new(&cfg, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Authentication key required"));

        let cfg = ExoscaleConfig {
            key: "key".to_string(),
            zone: Some("ch-gva-2".to_string()),
            instance_id: Some("instance".to_string()),
            ..ExoscaleConfig::default()
        };
        let err = ExoscaleProvider::new(&cfg, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Authentication secret required"));
    }

    #[tokio::test]
    async fn zone_determines_default_endpoint() {
        let cfg = ExoscaleConfig {
            key: "key".to_string(),
            secret: "secret".to_string(),
            zone: Some("ch-dk-2".to_string()),
            instance_id: Some("instance".to_string()),
            ..ExoscaleConfig::default()
        };

        let provider = ExoscaleProvider::new(&cfg, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(provider.api.endpoint, "https://api-ch-dk-2.exoscale.com/v2");
    }

    #[tokio::test]
    async fn endpoint_override_wins() {
        let cfg = ExoscaleConfig {
            key: "key".to_string(),
            secret: "secret".to_string(),
            zone: Some("ch-gva-2".to_string()),
            instance_id: Some("instance".to_string()),
            endpoint: Some("https://exoscale.example.com/v2/".to_string()),
        };

        let provider = ExoscaleProvider::new(&cfg, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(provider.api.endpoint, "https://exoscale.example.com/v2");
    }

    #[test]
    fn wire_shapes_deserialize() {
        let list: ElasticIpList = serde_json::from_str(
            r#"{"elastic-ips": [{"id": "eip-1", "ip": "192.0.2.10"}]}"#,
        )
        .unwrap();
        assert_eq!(list.elastic_ips.len(), 1);
        assert_eq!(list.elastic_ips[0].ip, "192.0.2.10".parse::<IpAddr>().unwrap());

        let instance: Instance = serde_json::from_str(
            r#"{"id": "i-1", "elastic-ips": [{"id": "eip-1", "ip": "192.0.2.10"}]}"#,
        )
        .unwrap();
        assert_eq!(instance.elastic_ips[0].id, "eip-1");

        let bare: Instance = serde_json::from_str(r#"{"id": "i-2"}"#).unwrap();
        assert!(bare.elastic_ips.is_empty());

        let operation: Operation =
            serde_json::from_str(r#"{"id": "op-1", "state": "pending"}"#).unwrap();
        assert_eq!(operation.state, "pending");
    }

    #[test]
    fn config_yaml_keys() {
        let yaml = r#"
endpoint: "https://exoscale.example.com/v2"
zone: "ch-gva-2"
key: "api-key"
secret: "api-secret"
instance-id: "7faa0bb2"
"#;
        let cfg: ExoscaleConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.key, "api-key");
        assert_eq!(cfg.instance_id.as_deref(), Some("7faa0bb2"));

        assert!(serde_yaml::from_str::<ExoscaleConfig>("token: x").is_err());
    }
}
