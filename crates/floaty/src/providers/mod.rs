//! Cloud provider implementations of the elastic IP refresh capability.

pub mod cloudscale;
pub mod exoscale;
pub mod fake;

use crate::address::NetAddress;
use crate::backoff::RetryError;
use async_trait::async_trait;
use common::Result;

pub use cloudscale::{CloudscaleConfig, CloudscaleProvider};
pub use exoscale::{ExoscaleConfig, ExoscaleProvider};
pub use fake::FakeProvider;

/// User agent sent with provider API calls.
pub(crate) const USER_AGENT: &str = concat!("floaty/", env!("CARGO_PKG_VERSION"));

/// A cloud provider able to reassert elastic IP ownership.
#[async_trait]
pub trait Provider: Send + Sync + std::fmt::Debug {
    /// Validate credentials and reachability. Must not mutate any state.
    async fn test(&self) -> Result<()>;

    /// Build a refresher for one managed address.
    ///
    /// May perform upfront lookups, such as discovering the elastic IP
    /// object whose network contains `address`.
    async fn new_refresher(&self, address: NetAddress) -> Result<Box<dyn Refresher>>;
}

/// Per-address worker reasserting ownership of one elastic IP.
#[async_trait]
pub trait Refresher: Send + Sync {
    /// Bind the address to this node and detach it from any other instance
    /// that still holds it.
    ///
    /// Idempotent: refreshing an address already bound to this node is a
    /// successful no-op. Client-side API failures (HTTP 4xx) are permanent,
    /// server-side and network failures transient.
    async fn refresh(&self) -> std::result::Result<(), RetryError>;

    /// Identity of the managed address for log output.
    fn describe(&self) -> String;
}
