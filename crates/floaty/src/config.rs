//! Configuration loading and validation.

use crate::address::NetAddress;
use crate::backoff::BackOffConfig;
use crate::keepalived::KeepalivedConfig;
use crate::providers::{
    CloudscaleConfig, CloudscaleProvider, ExoscaleConfig, ExoscaleProvider, FakeProvider, Provider,
};
use common::{Error, Result};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use validator::{Validate, ValidationError};

const DEFAULT_LOCK_FILE_TEMPLATE: &str = "/var/lock/floaty.%s.lock";
const DEFAULT_KEEPALIVED_CONFIG: &str = "/etc/keepalived/keepalived.conf";

/// Characters kept verbatim in a URL path segment: the unreserved set
/// `- _ . ~` plus the reserved characters a path segment may carry,
/// `$ & + : = @`. Of the reserved set only `/ ; , ?` are escaped, so the
/// resulting lock file names are byte-identical to Go's `url.PathEscape`.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'$')
    .remove(b'&')
    .remove(b'+')
    .remove(b':')
    .remove(b'=')
    .remove(b'@');

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct NotifyConfig {
    /// printf-style template; the single `%s` receives the URL-path-escaped
    /// VRRP instance name.
    #[validate(custom = "validate_lock_file_template")]
    pub lock_file_template: String,

    #[serde(with = "humantime_serde")]
    pub lock_timeout: Duration,

    pub keepalived_config: PathBuf,

    pub managed_addresses: Vec<NetAddress>,

    #[serde(with = "humantime_serde")]
    pub refresh_interval: Duration,

    #[serde(with = "humantime_serde")]
    pub refresh_timeout: Duration,

    pub back_off: BackOffConfig,

    pub provider: String,
    pub cloudscale: CloudscaleConfig,
    pub exoscale: ExoscaleConfig,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            lock_file_template: DEFAULT_LOCK_FILE_TEMPLATE.to_string(),
            lock_timeout: Duration::from_secs(10),
            keepalived_config: PathBuf::from(DEFAULT_KEEPALIVED_CONFIG),
            managed_addresses: Vec::new(),
            refresh_interval: Duration::from_secs(60),
            refresh_timeout: Duration::from_secs(10),
            back_off: BackOffConfig::default(),
            provider: String::new(),
            cloudscale: CloudscaleConfig::default(),
            exoscale: ExoscaleConfig::default(),
        }
    }
}

fn validate_lock_file_template(template: &str) -> std::result::Result<(), ValidationError> {
    if template.matches("%s").count() != 1 {
        return Err(ValidationError::new("lock_file_template_placeholder"));
    }
    Ok(())
}

impl NotifyConfig {
    /// Load the configuration file at `path` over the defaults.
    ///
    /// Unknown keys are rejected. A dry run replaces the configured provider
    /// with the fake one.
    pub fn load(path: impl AsRef<Path>, dry_run: bool) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let mut config: NotifyConfig = serde_yaml::from_str(&contents)?;
        config
            .validate()
            .map_err(|err| Error::config(err.to_string()))?;

        if dry_run {
            config.provider = "fake".to_string();
        }

        Ok(config)
    }

    /// Instantiate the configured provider.
    pub async fn new_provider(&self) -> Result<Box<dyn Provider>> {
        match self.provider.as_str() {
            "" => Err(Error::config("Missing provider")),
            "cloudscale" => Ok(Box::new(
                CloudscaleProvider::new(&self.cloudscale, self.refresh_timeout).await?,
            )),
            "exoscale" => Ok(Box::new(
                ExoscaleProvider::new(&self.exoscale, self.refresh_timeout).await?,
            )),
            "fake" => Ok(Box::new(FakeProvider::new())),
            other => Err(Error::config(format!("Provider {other:?} not supported"))),
        }
    }

    /// Lock file path for a VRRP instance.
    pub fn make_lock_file_path(&self, instance: &str) -> PathBuf {
        let escaped = utf8_percent_encode(instance, PATH_SEGMENT).to_string();
        PathBuf::from(self.lock_file_template.replacen("%s", &escaped, 1))
    }

    /// Addresses managed for a VRRP instance.
    ///
    /// An explicit managed-addresses list overrides the Keepalived
    /// configuration lookup.
    pub fn resolve_addresses(&self, instance: &str) -> Result<Vec<NetAddress>> {
        if !self.managed_addresses.is_empty() {
            return Ok(self.managed_addresses.clone());
        }

        let parsed = KeepalivedConfig::parse_file(&self.keepalived_config)?;
        let vrrp_instance = parsed
            .instance(instance)
            .ok_or_else(|| Error::config(format!("No VRRP instance named {instance:?}")))?;

        Ok(vrrp_instance.addresses.clone())
    }
}
