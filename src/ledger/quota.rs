/// Per-payer count of completed paid actions.
use crate::error::Result;
use crate::ledger::store::JsonFileStore;
use crate::types::address_hex;
use ethers::types::Address;
use std::path::PathBuf;

pub struct QuotaLedger {
    store: JsonFileStore<u64>,
}

impl QuotaLedger {
    pub fn in_memory() -> Self {
        Self {
            store: JsonFileStore::in_memory(),
        }
    }

    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            store: JsonFileStore::open(path).await?,
        })
    }

    pub async fn count(&self, payer: &Address) -> u64 {
        self.store.get(&address_hex(payer)).await.unwrap_or(0)
    }

    /// Record one more completed action for `payer`, returning the new count.
    pub async fn increment(&self, payer: &Address) -> Result<u64> {
        self.store
            .update(&address_hex(payer), |current| {
                let next = current.copied().unwrap_or(0).saturating_add(1);
                (Some(next), next)
            })
            .await
    }
}
