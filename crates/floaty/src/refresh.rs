//! Refresh engine: one reassertion loop per managed address.

use crate::address::NetAddress;
use crate::backoff::RetryError;
use crate::config::NotifyConfig;
use crate::providers::{Provider, Refresher};
use crate::retry::loop_with_retries;
use common::{Error, Result};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Keep the given addresses bound to this node until the scope ends.
///
/// Builds one refresher per address up front (failures abort the engine
/// before any loop starts), then runs the loops concurrently. Returns only
/// after every loop has stopped.
pub async fn pin_elastic_ips(
    scope: &CancellationToken,
    provider: &dyn Provider,
    addresses: &[NetAddress],
    cfg: &NotifyConfig,
) -> Result<()> {
    let mut refreshers = Vec::with_capacity(addresses.len());
    for address in addresses {
        refreshers.push(provider.new_refresher(*address).await?);
    }

    let mut loops = JoinSet::new();

    for refresher in refreshers {
        let scope = scope.clone();
        let interval = cfg.refresh_interval;
        let timeout = cfg.refresh_timeout;
        let retry_backoff = cfg.back_off.build();

        loops.spawn(async move {
            run_refresher(scope, interval, timeout, retry_backoff, refresher).await;
        });
    }

    while loops.join_next().await.is_some() {}

    Ok(())
}

async fn run_refresher(
    scope: CancellationToken,
    interval: Duration,
    timeout: Duration,
    retry_backoff: crate::backoff::ExponentialBackOff,
    refresher: Box<dyn Refresher>,
) {
    info!(
        address = %refresher.describe(),
        interval_secs = interval.as_secs(),
        "Refreshing address on average interval"
    );

    let target: &dyn Refresher = refresher.as_ref();

    loop_with_retries(scope.clone(), interval, retry_backoff, move || {
        let call = target.refresh();
        async move {
            match tokio::time::timeout(timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(RetryError::transient(Error::provider(format!(
                    "Refresh of {} timed out after {:?}",
                    target.describe(),
                    timeout
                )))),
            }
        }
    })
    .await;

    debug!(address = %refresher.describe(), "Refresh loop shut down");
}
