//! Idempotency ledger keyed by payload fingerprint.
//!
//! A fingerprint moves through two persisted states:
//!
//! - `delivered`: the paid action ran, settlement has not succeeded yet.
//!   A retry settles again but never re-runs the action.
//! - `completed`: settlement succeeded. The record is the replayable outcome.
//!
//! Only `completed` counts as marked. Work on a fingerprint requires a
//! [`ClaimGuard`], which also keeps a second request for the same fingerprint
//! out while the first is in flight.
//!
//! A record whose write to disk fails is still held in memory and honoured
//! for the life of the process, so a failed journal write never turns a
//! delivered fingerprint back into a fresh one.

use crate::error::Result;
use crate::ledger::store::JsonFileStore;
use crate::types::{address_hex, current_timestamp};
use ethers::types::Address;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Delivered,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdempotencyRecord {
    pub fingerprint: String,
    pub payer: String,
    pub status: RecordStatus,
    /// Output of the paid action.
    #[serde(default)]
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    pub delivered_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settled_at: Option<u64>,
}

impl IdempotencyRecord {
    pub fn is_completed(&self) -> bool {
        self.status == RecordStatus::Completed
    }
}

/// Exclusive, process-local hold on one fingerprint. Released on drop.
#[derive(Debug)]
pub struct ClaimGuard {
    fingerprint: String,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl ClaimGuard {
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.fingerprint);
    }
}

#[derive(Debug)]
pub enum Claim {
    /// Already settled; replay this.
    Completed(IdempotencyRecord),
    /// The action already ran; only settlement may be retried.
    Delivered(IdempotencyRecord, ClaimGuard),
    /// Never seen.
    Fresh(ClaimGuard),
    /// Another request holds this fingerprint right now.
    InFlight,
}

pub struct IdempotencyLedger {
    store: JsonFileStore<IdempotencyRecord>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    /// Newer than the store for their key until a later write succeeds.
    unpersisted: Mutex<HashMap<String, IdempotencyRecord>>,
}

impl IdempotencyLedger {
    pub fn in_memory() -> Self {
        Self::with_store(JsonFileStore::in_memory())
    }

    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self::with_store(JsonFileStore::open(path).await?))
    }

    fn with_store(store: JsonFileStore<IdempotencyRecord>) -> Self {
        Self {
            store,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            unpersisted: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, fingerprint: &str) -> Option<IdempotencyRecord> {
        if let Some(record) = self.unpersisted.lock().get(fingerprint) {
            return Some(record.clone());
        }
        self.store.get(fingerprint).await
    }

    /// Persist `record`, keeping it in memory if the write fails.
    async fn write(&self, record: IdempotencyRecord) -> Result<()> {
        let fingerprint = record.fingerprint.clone();
        let result = self
            .store
            .update(&fingerprint, |_| (Some(record.clone()), ()))
            .await;
        let mut unpersisted = self.unpersisted.lock();
        match result {
            Ok(()) => {
                unpersisted.remove(&fingerprint);
            }
            Err(_) => {
                warn!(fingerprint = %fingerprint, "holding unpersisted record in memory");
                unpersisted.insert(fingerprint, record);
            }
        }
        result
    }

    pub async fn is_completed(&self, fingerprint: &str) -> bool {
        self.get(fingerprint)
            .await
            .is_some_and(|record| record.is_completed())
    }

    pub async fn claim(&self, fingerprint: &str) -> Claim {
        // completed replays skip the in-flight set entirely
        if let Some(record) = self.get(fingerprint).await {
            if record.is_completed() {
                return Claim::Completed(record);
            }
        }

        if !self.in_flight.lock().insert(fingerprint.to_string()) {
            debug!(fingerprint, "fingerprint already in flight");
            return Claim::InFlight;
        }
        let guard = ClaimGuard {
            fingerprint: fingerprint.to_string(),
            in_flight: self.in_flight.clone(),
        };

        // re-read: the previous holder may have finished in between
        match self.get(fingerprint).await {
            Some(record) if record.is_completed() => Claim::Completed(record),
            Some(record) => Claim::Delivered(record, guard),
            None => Claim::Fresh(guard),
        }
    }

    /// Journal that the paid action succeeded for the claimed fingerprint.
    ///
    /// # Errors
    ///
    /// A failed write is reported, but the delivery is still remembered by
    /// this ledger until the process exits.
    pub async fn record_delivery(
        &self,
        claim: &ClaimGuard,
        payer: &Address,
        output: &Value,
    ) -> Result<()> {
        if self.is_completed(&claim.fingerprint).await {
            return Ok(());
        }
        self.write(IdempotencyRecord {
            fingerprint: claim.fingerprint.clone(),
            payer: address_hex(payer),
            status: RecordStatus::Delivered,
            output: output.clone(),
            transaction: None,
            network: None,
            delivered_at: current_timestamp(),
            settled_at: None,
        })
        .await
    }

    /// Mark the claimed fingerprint completed. Call only after settlement succeeded.
    pub async fn mark_completed(
        &self,
        claim: &ClaimGuard,
        payer: &Address,
        output: &Value,
        transaction: &str,
        network: &str,
    ) -> Result<IdempotencyRecord> {
        let now = current_timestamp();
        let delivered_at = self
            .get(&claim.fingerprint)
            .await
            .map(|record| record.delivered_at)
            .unwrap_or(now);
        let record = IdempotencyRecord {
            fingerprint: claim.fingerprint.clone(),
            payer: address_hex(payer),
            status: RecordStatus::Completed,
            output: output.clone(),
            transaction: Some(transaction.to_string()),
            network: Some(network.to_string()),
            delivered_at,
            settled_at: Some(now),
        };
        self.write(record.clone()).await?;
        Ok(record)
    }

    pub async fn len(&self) -> usize {
        self.store.len().await
    }

    pub async fn is_empty(&self) -> bool {
        self.store.is_empty().await
    }
}
