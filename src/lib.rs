//! x402 payment gate.
//!
//! Gates a paid server-side action behind a signed EIP-3009
//! `transferWithAuthorization` and settles each authorization exactly once.
//!
//! ```text
//! request ──> extract ──> verify ──> admit ──> claim ──> paid action ──> settle ──> commit
//!               │           │          │         │            │             │
//!              402        402        403    replay/409       502           502
//! ```
//!
//! The HTTP layer hands an [`extract::InboundPayment`] to
//! [`core::PaymentOrchestrator::handle`] and renders the returned
//! [`core::GateOutcome`].

pub mod config;
pub mod core;
pub mod eligibility;
pub mod error;
pub mod extract;
pub mod ledger;
pub mod policy;
pub mod settlement;
pub mod types;
pub mod verifier;

pub use crate::config::{ConfigBuilder, ConfigManager, GateConfig, SecretKey};
pub use crate::core::{
    ActionOutcome, DenialReason, GateOutcome, OrchestratorBuilder, PaidAction, PaymentOrchestrator,
    PaymentState,
};
pub use crate::error::{Error, Result};
pub use crate::extract::{InboundPayment, extract_payment};
pub use crate::settlement::{DirectSettlement, FacilitatorClient, SettlementStrategy};
pub use crate::types::{
    EvmNetwork, InvalidReason, PaymentEnvelope, PaymentRequirement, SettlementOutcome,
    VerificationOutcome,
};
pub use crate::verifier::{LocalVerifier, PaymentVerifier};
