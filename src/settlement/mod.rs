//! Settlement strategies.
//!
//! Settlement moves the authorized funds. Two interchangeable strategies exist
//! and one of them is chosen when the gate is configured:
//!
//! - [`facilitator::FacilitatorClient`] delegates to a remote settlement service.
//! - [`direct::DirectSettlement`] submits `transferWithAuthorization` itself.
//!
//! Strategies never deduplicate; the orchestrator calls `settle` at most once
//! per fingerprint at a time. Every failure, including transport errors, comes
//! back as [`SettlementOutcome::Failed`].

use crate::types::{PaymentEnvelope, PaymentRequirement, SettlementOutcome};
use async_trait::async_trait;

pub mod direct;
pub mod facilitator;

pub use direct::{DirectSettlement, EthersSubmitter, SubmittedTransfer, TransferSubmitter};
pub use facilitator::{FacilitatorClient, FacilitatorConfig};

#[async_trait]
pub trait SettlementStrategy: Send + Sync {
    async fn settle(
        &self,
        envelope: &PaymentEnvelope,
        requirement: &PaymentRequirement,
    ) -> SettlementOutcome;

    fn name(&self) -> &str;
}
