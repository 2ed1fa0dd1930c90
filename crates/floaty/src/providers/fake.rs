//! Fake provider for tests and dry runs.

use super::{Provider, Refresher};
use crate::address::NetAddress;
use crate::backoff::RetryError;
use async_trait::async_trait;
use common::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Provider that only counts refreshes and reports them on stdout.
#[derive(Debug, Default, Clone)]
pub struct FakeProvider {
    refresh_counter: Arc<Mutex<HashMap<String, u64>>>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of refreshes recorded for `address` so far.
    pub fn refresh_count(&self, address: &NetAddress) -> u64 {
        let counters = self.refresh_counter.lock().expect("counter lock");
        counters.get(&address.to_string()).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Provider for FakeProvider {
    async fn test(&self) -> Result<()> {
        Ok(())
    }

    async fn new_refresher(&self, address: NetAddress) -> Result<Box<dyn Refresher>> {
        Ok(Box::new(FakeRefresher {
            address,
            refresh_counter: self.refresh_counter.clone(),
        }))
    }
}

struct FakeRefresher {
    address: NetAddress,
    refresh_counter: Arc<Mutex<HashMap<String, u64>>>,
}

#[async_trait]
impl Refresher for FakeRefresher {
    async fn refresh(&self) -> std::result::Result<(), RetryError> {
        let key = self.address.to_string();

        {
            let mut counters = self.refresh_counter.lock().expect("counter lock");
            *counters.entry(key.clone()).or_insert(0) += 1;
        }

        println!("REFRESH {key}");
        Ok(())
    }

    fn describe(&self) -> String {
        self.address.to_string()
    }
}
