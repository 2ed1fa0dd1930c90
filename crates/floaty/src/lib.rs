//! Floaty - Keepalived notification helper
//!
//! Floaty runs alongside a VRRP daemon (Keepalived) on hosts doing
//! active/passive failover. When the local node becomes MASTER for a virtual
//! router, floaty binds the router's floating IP addresses to this node at
//! the cloud-provider level and keeps reasserting that binding until the node
//! stops being MASTER or the VRRP daemon goes away.
//!
//! # Components
//!
//! - **Providers**: Cloudscale / Exoscale / fake implementations of the
//!   elastic IP refresh capability
//! - **Refresh engine**: one jittered refresh loop per managed address
//! - **Lock**: per-instance lock file with SIGTERM preemption of the
//!   previous owner
//! - **Dispatchers**: one-shot (argv) and long-lived FIFO notification
//!   handling

pub mod address;
pub mod backoff;
pub mod config;
pub mod fifo;
pub mod keepalived;
pub mod lock;
pub mod notification;
pub mod oom;
pub mod process;
pub mod providers;
pub mod refresh;
pub mod retry;

pub use address::NetAddress;
pub use config::NotifyConfig;
pub use notification::{Notification, VrrpState};
pub use providers::{Provider, Refresher};
