/// x402 Core module.
use crate::config::{ConfigManager, SettlementConfig, VerificationMode};
use crate::eligibility::{Admission, AllowList, EligibilityGate, EligibilitySource};
use crate::error::{Error, Result};
use crate::extract::{InboundPayment, extract_payment};
use crate::ledger::{Claim, ClaimGuard, IdempotencyLedger, IdempotencyRecord, QuotaLedger};
use crate::policy::{Policy, PolicySource, PolicyStore};
use crate::settlement::{
    DirectSettlement, EthersSubmitter, FacilitatorClient, FacilitatorConfig, SettlementStrategy,
};
use crate::types::{
    InvalidReason, PaymentEnvelope, PaymentRequiredResponse, PaymentRequirement, SettleResponse,
    SettlementOutcome, VerificationOutcome, address_hex,
};
use crate::verifier::{LocalVerifier, PaymentVerifier};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ethers::types::Address;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{Instrument, debug, error, info, info_span, warn};
use url::Url;
use uuid::Uuid;

pub const DEFAULT_SETTLEMENT_TIMEOUT: Duration = Duration::from_secs(30);

/// The paid side effect, e.g. minting a token or calling a metered API.
#[async_trait]
pub trait PaidAction: Send + Sync {
    async fn perform(&self, payer: &Address) -> ActionOutcome;
}

#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    Success { output: Value },
    Failure { reason: String },
}

impl ActionOutcome {
    pub fn success(output: Value) -> Self {
        ActionOutcome::Success { output }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        ActionOutcome::Failure {
            reason: reason.into(),
        }
    }
}

/// Where a request is in the payment state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentState {
    AwaitingPayload,
    Verifying,
    Rejected,
    AdmissionPending,
    Denied,
    SideEffectPending,
    SideEffectFailed,
    SettlementPending,
    SettlementFailed,
    Completed,
}

impl PaymentState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PaymentState::Rejected
                | PaymentState::Denied
                | PaymentState::SideEffectFailed
                | PaymentState::SettlementFailed
                | PaymentState::Completed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DenialReason {
    #[error("payer is not eligible")]
    NotEligible,
    #[error("per-identity limit reached ({completed}/{limit})")]
    QuotaExceeded { completed: u64, limit: u64 },
}

/// Terminal result of one orchestrated request.
#[derive(Debug, Clone, PartialEq)]
pub enum GateOutcome {
    /// No payment offered; advertise the requirement.
    PaymentRequired(PaymentRequiredResponse),
    Rejected {
        reason: InvalidReason,
    },
    Denied {
        payer: Address,
        reason: DenialReason,
    },
    SideEffectFailed {
        payer: Address,
        reason: String,
    },
    /// Value was delivered but payment was not collected. Needs reconciliation.
    SettlementFailed {
        payer: Address,
        fingerprint: String,
        network: String,
        output: Value,
        reason: String,
    },
    Completed {
        payer: Address,
        fingerprint: String,
        transaction: String,
        network: String,
        output: Value,
        /// Served from the idempotency ledger.
        replayed: bool,
    },
    /// Another request for the same payload is being processed.
    InFlight {
        fingerprint: String,
    },
}

impl GateOutcome {
    pub fn state(&self) -> PaymentState {
        match self {
            GateOutcome::PaymentRequired(_) => PaymentState::AwaitingPayload,
            GateOutcome::Rejected { .. } => PaymentState::Rejected,
            GateOutcome::Denied { .. } => PaymentState::Denied,
            GateOutcome::SideEffectFailed { .. } => PaymentState::SideEffectFailed,
            GateOutcome::SettlementFailed { .. } => PaymentState::SettlementFailed,
            GateOutcome::Completed { .. } => PaymentState::Completed,
            // admitted, but the claim on the fingerprint belongs to someone else
            GateOutcome::InFlight { .. } => PaymentState::AdmissionPending,
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            GateOutcome::PaymentRequired(_) | GateOutcome::Rejected { .. } => 402,
            GateOutcome::Denied { .. } => 403,
            GateOutcome::InFlight { .. } => 409,
            GateOutcome::SideEffectFailed { .. } | GateOutcome::SettlementFailed { .. } => 502,
            GateOutcome::Completed { .. } => 200,
        }
    }

    pub fn should_serve_content(&self) -> bool {
        matches!(self, GateOutcome::Completed { .. })
    }

    /// Settlement receipt for the `X-PAYMENT-RESPONSE` header.
    pub fn payment_response_header(&self) -> Option<String> {
        let response = match self {
            GateOutcome::Completed {
                payer,
                transaction,
                network,
                ..
            } => SettleResponse {
                success: true,
                error_reason: None,
                transaction: transaction.clone(),
                network: network.clone(),
                payer: Some(address_hex(payer)),
            },
            GateOutcome::SettlementFailed {
                payer,
                network,
                reason,
                ..
            } => SettleResponse {
                success: false,
                error_reason: Some(reason.clone()),
                transaction: String::new(),
                network: network.clone(),
                payer: Some(address_hex(payer)),
            },
            _ => return None,
        };
        serde_json::to_vec(&response)
            .ok()
            .map(|bytes| STANDARD.encode(bytes))
    }

    /// JSON body for the HTTP layer.
    pub fn to_json(&self) -> Value {
        match self {
            GateOutcome::PaymentRequired(required) => json!(required),
            GateOutcome::Rejected { reason } => json!({
                "status": "rejected",
                "error": reason.to_string(),
            }),
            GateOutcome::Denied { payer, reason } => json!({
                "status": "denied",
                "payer": address_hex(payer),
                "error": reason.to_string(),
            }),
            GateOutcome::SideEffectFailed { payer, reason } => json!({
                "status": "side-effect-failed",
                "payer": address_hex(payer),
                "error": reason,
                "mintSucceeded": false,
                "paymentSettled": false,
            }),
            GateOutcome::SettlementFailed {
                payer,
                fingerprint,
                network,
                output,
                reason,
            } => json!({
                "status": "settlement-failed",
                "payer": address_hex(payer),
                "fingerprint": fingerprint,
                "network": network,
                "output": output,
                "error": reason,
                "mintSucceeded": true,
                "paymentSettled": false,
            }),
            GateOutcome::Completed {
                payer,
                fingerprint,
                transaction,
                network,
                output,
                replayed,
            } => json!({
                "status": "completed",
                "payer": address_hex(payer),
                "fingerprint": fingerprint,
                "transaction": transaction,
                "network": network,
                "output": output,
                "replayed": replayed,
                "mintSucceeded": true,
                "paymentSettled": true,
            }),
            GateOutcome::InFlight { fingerprint } => json!({
                "status": "in-flight",
                "fingerprint": fingerprint,
            }),
        }
    }

    fn replayed(record: IdempotencyRecord, payer: Address) -> Self {
        GateOutcome::Completed {
            payer,
            fingerprint: record.fingerprint,
            transaction: record.transaction.unwrap_or_default(),
            network: record.network.unwrap_or_default(),
            output: record.output,
            replayed: true,
        }
    }
}

/// Sequences verification, admission, the paid action and settlement.
///
/// Ordering guarantees:
///
/// - settlement is never attempted unless the paid action succeeded
/// - the quota ledger is incremented after the action and before settlement
/// - a fingerprint is marked completed only after settlement succeeded
///
/// # Examples
///
/// ```rust,ignore
/// use x402_gate::core::PaymentOrchestrator;
/// use x402_gate::extract::InboundPayment;
///
/// let gate = PaymentOrchestrator::from_config(&ConfigManager::new()?, Arc::new(MintAction)).await?;
///
/// let outcome = gate.handle(&InboundPayment::from_header(x_payment)).await;
/// if outcome.should_serve_content() {
///     // return 200 with outcome.to_json() and the X-PAYMENT-RESPONSE header
/// }
/// ```
#[derive(Clone)]
pub struct PaymentOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    requirement: PaymentRequirement,
    verifier: Arc<dyn PaymentVerifier>,
    settlement: Arc<dyn SettlementStrategy>,
    action: Arc<dyn PaidAction>,
    policy: Arc<dyn PolicySource>,
    gate: EligibilityGate,
    idempotency: Arc<IdempotencyLedger>,
    settlement_timeout: Duration,
    payer_locks: Mutex<HashMap<Address, Arc<AsyncMutex<()>>>>,
}

impl PaymentOrchestrator {
    pub fn builder(requirement: PaymentRequirement, action: Arc<dyn PaidAction>) -> OrchestratorBuilder {
        OrchestratorBuilder::new(requirement, action)
    }

    /// Wire an orchestrator from configuration. The strategy is fixed here.
    pub async fn from_config(config: &ConfigManager, action: Arc<dyn PaidAction>) -> Result<Self> {
        let requirement = config.payment_requirement()?;
        let settlement_config = config.settlement();
        let gate_config = config.get_config();

        let mut facilitator: Option<Arc<FacilitatorClient>> = None;
        let settlement: Arc<dyn SettlementStrategy> = match &settlement_config {
            SettlementConfig::Facilitator { url, timeout_secs } => {
                let url = Url::parse(url)
                    .map_err(|e| Error::Config(format!("invalid facilitator url {}: {}", url, e)))?;
                let client = Arc::new(FacilitatorClient::new(FacilitatorConfig {
                    url,
                    timeout: Duration::from_secs(*timeout_secs),
                })?);
                facilitator = Some(client.clone());
                client
            }
            SettlementConfig::Direct {
                rpc_url,
                confirmations,
                ..
            } => {
                let key = config.signer_key().ok_or_else(|| {
                    Error::Config("X402_SIGNER_PRIVATE_KEY is required for direct settlement".to_string())
                })?;
                let submitter = EthersSubmitter::new(rpc_url, &key, requirement.network.chain_id())?
                    .with_confirmations(*confirmations);
                info!("direct settlement from {}", address_hex(&submitter.signer_address()));
                Arc::new(DirectSettlement::new(submitter))
            }
        };

        let verifier: Arc<dyn PaymentVerifier> = match (gate_config.verification, facilitator) {
            (VerificationMode::Local, _) => Arc::new(LocalVerifier::new()),
            (VerificationMode::Facilitator, Some(client)) => client,
            (VerificationMode::Facilitator, None) => {
                return Err(Error::Config(
                    "facilitator verification requires facilitator settlement".to_string(),
                ));
            }
        };

        let defaults = config.default_policy();
        let policy: Arc<dyn PolicySource> = match &gate_config.policy.path {
            Some(path) => Arc::new(PolicyStore::new(
                path.clone(),
                Duration::from_secs(gate_config.policy.ttl_secs),
                defaults,
            )),
            None => Arc::new(defaults),
        };

        let allowlist: Arc<dyn EligibilitySource> = match &gate_config.allowlist.path {
            Some(path) => Arc::new(AllowList::from_file(
                path.clone(),
                Duration::from_secs(gate_config.allowlist.ttl_secs),
            )),
            None => Arc::new(AllowList::from_entries(Vec::<String>::new())),
        };

        let idempotency = match &gate_config.ledger.idempotency_path {
            Some(path) => IdempotencyLedger::open(path.clone()).await?,
            None => IdempotencyLedger::in_memory(),
        };
        let quota = match &gate_config.ledger.quota_path {
            Some(path) => QuotaLedger::open(path.clone()).await?,
            None => QuotaLedger::in_memory(),
        };

        Self::builder(requirement, action)
            .with_verifier(verifier)
            .with_settlement(settlement)
            .with_policy(policy)
            .with_allowlist(allowlist)
            .with_idempotency_ledger(Arc::new(idempotency))
            .with_quota_ledger(Arc::new(quota))
            .with_settlement_timeout(settlement_config.timeout())
            .build()
    }

    pub fn requirement(&self) -> &PaymentRequirement {
        &self.inner.requirement
    }

    pub fn payment_required(&self) -> PaymentRequiredResponse {
        PaymentRequiredResponse::new(&self.inner.requirement, "X-PAYMENT header is required")
    }

    pub fn idempotency_ledger(&self) -> &IdempotencyLedger {
        &self.inner.idempotency
    }

    pub fn quota_ledger(&self) -> &QuotaLedger {
        self.inner.gate.quota()
    }

    /// Entry point for the HTTP layer.
    pub async fn handle(&self, inbound: &InboundPayment) -> GateOutcome {
        let span = info_span!("x402_payment", request_id = %Uuid::new_v4());
        async {
            match extract_payment(inbound) {
                Ok(Some(envelope)) => self.process(envelope).await,
                Ok(None) => {
                    debug!("no payment offered");
                    GateOutcome::PaymentRequired(self.payment_required())
                }
                Err(reason) => {
                    info!("payment rejected: {}", reason);
                    GateOutcome::Rejected { reason }
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Process an already-extracted envelope.
    pub async fn handle_payment(&self, envelope: PaymentEnvelope) -> GateOutcome {
        let span = info_span!("x402_payment", request_id = %Uuid::new_v4());
        self.process(envelope).instrument(span).await
    }

    async fn process(&self, envelope: PaymentEnvelope) -> GateOutcome {
        let inner = &self.inner;
        debug!(state = ?PaymentState::Verifying, verifier = inner.verifier.name());
        let payer = match inner
            .verifier
            .verify_payment(&envelope, &inner.requirement)
            .await
        {
            VerificationOutcome::Valid { payer } => payer,
            VerificationOutcome::Invalid { reason } => {
                info!("payment rejected: {}", reason);
                return GateOutcome::Rejected { reason };
            }
        };

        debug!(state = ?PaymentState::AdmissionPending, payer = %address_hex(&payer));
        let policy = inner.policy.current_policy();
        if let Admission::NotEligible = inner.gate.check_eligibility(&payer, &policy) {
            info!("payer {} denied: not on allow-list", address_hex(&payer));
            return GateOutcome::Denied {
                payer,
                reason: DenialReason::NotEligible,
            };
        }

        let fingerprint = envelope.fingerprint();
        let claim = inner.idempotency.claim(&fingerprint).await;
        let (guard, delivered) = match claim {
            Claim::Completed(record) => {
                info!("replaying completed payment {}", fingerprint);
                return GateOutcome::replayed(record, payer);
            }
            Claim::InFlight => {
                info!("payment {} already in flight", fingerprint);
                return GateOutcome::InFlight { fingerprint };
            }
            Claim::Delivered(record, guard) => (guard, Some(record.output)),
            Claim::Fresh(guard) => (guard, None),
        };

        // From here on the work runs in its own task so a dropped request
        // cannot leave a delivered action unsettled.
        let task_inner = inner.clone();
        let task = tokio::spawn(
            async move {
                task_inner
                    .run_claimed(envelope, payer, policy, guard, delivered)
                    .await
            }
            .in_current_span(),
        );
        match task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("payment task for {} failed: {}", fingerprint, e);
                GateOutcome::SettlementFailed {
                    payer,
                    fingerprint,
                    network: inner.requirement.network.as_str().to_string(),
                    output: Value::Null,
                    reason: "payment task aborted".to_string(),
                }
            }
        }
    }
}

impl Inner {
    async fn run_claimed(
        &self,
        envelope: PaymentEnvelope,
        payer: Address,
        policy: Policy,
        guard: ClaimGuard,
        delivered: Option<Value>,
    ) -> GateOutcome {
        let output = match delivered {
            Some(output) => {
                info!("action already delivered for {}, retrying settlement", guard.fingerprint());
                output
            }
            None => match self.deliver(&payer, &policy, &guard).await {
                Ok(output) => output,
                Err(outcome) => return outcome,
            },
        };
        self.settle_and_commit(&envelope, payer, guard, output).await
    }

    /// Quota check, paid action and quota increment, serialized per payer.
    async fn deliver(
        &self,
        payer: &Address,
        policy: &Policy,
        guard: &ClaimGuard,
    ) -> std::result::Result<Value, GateOutcome> {
        let lock = self.payer_lock(payer);
        let held = lock.lock().await;

        let result = match self.gate.check_quota(payer, policy).await {
            Admission::QuotaExceeded { completed, limit } => {
                info!("payer {} denied: {}/{} used", address_hex(payer), completed, limit);
                Err(GateOutcome::Denied {
                    payer: *payer,
                    reason: DenialReason::QuotaExceeded { completed, limit },
                })
            }
            _ => {
                debug!(state = ?PaymentState::SideEffectPending);
                match self.action.perform(payer).await {
                    ActionOutcome::Failure { reason } => {
                        warn!("paid action failed for {}: {}", address_hex(payer), reason);
                        Err(GateOutcome::SideEffectFailed {
                            payer: *payer,
                            reason,
                        })
                    }
                    ActionOutcome::Success { output } => {
                        match self.gate.quota().increment(payer).await {
                            Ok(count) => debug!("payer {} now at {} completed", address_hex(payer), count),
                            Err(e) => error!("failed to record quota for {}: {}", address_hex(payer), e),
                        }
                        if let Err(e) = self
                            .idempotency
                            .record_delivery(guard, payer, &output)
                            .await
                        {
                            error!("failed to persist delivery for {}, held in memory: {}", guard.fingerprint(), e);
                        }
                        Ok(output)
                    }
                }
            }
        };

        drop(held);
        drop(lock);
        self.release_payer_lock(payer);
        result
    }

    async fn settle_and_commit(
        &self,
        envelope: &PaymentEnvelope,
        payer: Address,
        guard: ClaimGuard,
        output: Value,
    ) -> GateOutcome {
        debug!(state = ?PaymentState::SettlementPending, strategy = self.settlement.name());
        let network = self.requirement.network.as_str().to_string();
        let outcome = match tokio::time::timeout(
            self.settlement_timeout,
            self.settlement.settle(envelope, &self.requirement),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => SettlementOutcome::failed("settlement timed out", &network, Some(payer)),
        };

        let fingerprint = guard.fingerprint().to_string();
        match outcome {
            SettlementOutcome::Settled {
                transaction,
                network,
                ..
            } => {
                if let Err(e) = self
                    .idempotency
                    .mark_completed(&guard, &payer, &output, &transaction, &network)
                    .await
                {
                    error!("settled {} in {} but failed to record it: {}", fingerprint, transaction, e);
                }
                info!("payment {} settled in {}", fingerprint, transaction);
                GateOutcome::Completed {
                    payer,
                    fingerprint,
                    transaction,
                    network,
                    output,
                    replayed: false,
                }
            }
            SettlementOutcome::Failed { reason, network, .. } => {
                error!("delivered {} but settlement failed: {}", fingerprint, reason);
                GateOutcome::SettlementFailed {
                    payer,
                    fingerprint,
                    network,
                    output,
                    reason,
                }
            }
        }
    }

    fn payer_lock(&self, payer: &Address) -> Arc<AsyncMutex<()>> {
        self.payer_locks
            .lock()
            .entry(*payer)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn release_payer_lock(&self, payer: &Address) {
        let mut locks = self.payer_locks.lock();
        if locks.get(payer).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(payer);
        }
    }
}

pub struct OrchestratorBuilder {
    requirement: PaymentRequirement,
    action: Arc<dyn PaidAction>,
    verifier: Option<Arc<dyn PaymentVerifier>>,
    settlement: Option<Arc<dyn SettlementStrategy>>,
    policy: Option<Arc<dyn PolicySource>>,
    allowlist: Option<Arc<dyn EligibilitySource>>,
    idempotency: Option<Arc<IdempotencyLedger>>,
    quota: Option<Arc<QuotaLedger>>,
    settlement_timeout: Duration,
}

impl OrchestratorBuilder {
    pub fn new(requirement: PaymentRequirement, action: Arc<dyn PaidAction>) -> Self {
        Self {
            requirement,
            action,
            verifier: None,
            settlement: None,
            policy: None,
            allowlist: None,
            idempotency: None,
            quota: None,
            settlement_timeout: DEFAULT_SETTLEMENT_TIMEOUT,
        }
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn PaymentVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn with_settlement(mut self, settlement: Arc<dyn SettlementStrategy>) -> Self {
        self.settlement = Some(settlement);
        self
    }

    pub fn with_policy(mut self, policy: Arc<dyn PolicySource>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn with_allowlist(mut self, allowlist: Arc<dyn EligibilitySource>) -> Self {
        self.allowlist = Some(allowlist);
        self
    }

    pub fn with_idempotency_ledger(mut self, ledger: Arc<IdempotencyLedger>) -> Self {
        self.idempotency = Some(ledger);
        self
    }

    pub fn with_quota_ledger(mut self, ledger: Arc<QuotaLedger>) -> Self {
        self.quota = Some(ledger);
        self
    }

    pub fn with_settlement_timeout(mut self, timeout: Duration) -> Self {
        self.settlement_timeout = timeout;
        self
    }

    /// Unset collaborators default to local verification, an unrestricted
    /// policy, an empty allow-list and in-memory ledgers.
    pub fn build(self) -> Result<PaymentOrchestrator> {
        let settlement = self
            .settlement
            .ok_or_else(|| Error::Config("a settlement strategy is required".to_string()))?;
        let quota = self
            .quota
            .unwrap_or_else(|| Arc::new(QuotaLedger::in_memory()));
        let allowlist = self
            .allowlist
            .unwrap_or_else(|| Arc::new(AllowList::from_entries(Vec::<String>::new())));
        info!(
            "payment gate for {} on {} settling via {}",
            self.requirement.resource,
            self.requirement.network,
            settlement.name()
        );
        Ok(PaymentOrchestrator {
            inner: Arc::new(Inner {
                requirement: self.requirement,
                verifier: self
                    .verifier
                    .unwrap_or_else(|| Arc::new(LocalVerifier::new())),
                settlement,
                action: self.action,
                policy: self
                    .policy
                    .unwrap_or_else(|| Arc::new(Policy::unrestricted())),
                gate: EligibilityGate::new(allowlist, quota),
                idempotency: self
                    .idempotency
                    .unwrap_or_else(|| Arc::new(IdempotencyLedger::in_memory())),
                settlement_timeout: self.settlement_timeout,
                payer_locks: Mutex::new(HashMap::new()),
            }),
        })
    }
}
