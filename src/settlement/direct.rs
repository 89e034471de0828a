/// Direct settlement: submit `transferWithAuthorization` from a funded key.
use crate::config::SecretKey;
use crate::error::{Error, Result};
use crate::settlement::SettlementStrategy;
use crate::types::{PaymentEnvelope, PaymentRequirement, SettlementOutcome, parse_decimal_u256};
use crate::verifier::evm::{self, SignatureParts, TypedAuthorization};
use async_trait::async_trait;
use ethers::contract::abigen;
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Http, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, U64};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

abigen!(
    Eip3009Token,
    r#"[
        function transferWithAuthorization(address from, address to, uint256 value, uint256 validAfter, uint256 validBefore, bytes32 nonce, uint8 v, bytes32 r, bytes32 s) external
        function authorizationState(address authorizer, bytes32 nonce) external view returns (bool)
    ]"#
);

/// Everything needed for one `transferWithAuthorization` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferCall {
    pub asset: Address,
    pub authorization: TypedAuthorization,
    pub signature: SignatureParts,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedTransfer {
    pub transaction: String,
    /// Receipt status was 1.
    pub succeeded: bool,
}

/// The ledger-facing half of direct settlement.
#[async_trait]
pub trait TransferSubmitter: Send + Sync {
    /// Whether the token already consumed `nonce` for `authorizer`.
    async fn authorization_used(
        &self,
        asset: Address,
        authorizer: Address,
        nonce: [u8; 32],
    ) -> std::result::Result<bool, String>;

    /// Submit and wait for the receipt.
    async fn submit(&self, call: &TransferCall) -> std::result::Result<SubmittedTransfer, String>;
}

type SignerClient = SignerMiddleware<Provider<Http>, LocalWallet>;

/// [`TransferSubmitter`] backed by an ethers JSON-RPC provider and a local key.
pub struct EthersSubmitter {
    client: Arc<SignerClient>,
    confirmations: usize,
}

impl EthersSubmitter {
    pub fn new(rpc_url: &str, signer_key: &SecretKey, chain_id: u64) -> Result<Self> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .map_err(|e| Error::Network(format!("Failed to create provider: {}", e)))?;
        let wallet = LocalWallet::from_str(signer_key.expose())
            .map_err(|_| Error::Config("signer private key is not a valid secp256k1 key".into()))?
            .with_chain_id(chain_id);
        info!(
            signer = %crate::types::address_hex(&wallet.address()),
            chain_id,
            "direct settlement signer loaded"
        );
        Ok(Self {
            client: Arc::new(SignerMiddleware::new(provider, wallet)),
            confirmations: 1,
        })
    }

    pub fn with_confirmations(mut self, confirmations: usize) -> Self {
        self.confirmations = confirmations.max(1);
        self
    }

    pub fn signer_address(&self) -> Address {
        self.client.signer().address()
    }
}

#[async_trait]
impl TransferSubmitter for EthersSubmitter {
    async fn authorization_used(
        &self,
        asset: Address,
        authorizer: Address,
        nonce: [u8; 32],
    ) -> std::result::Result<bool, String> {
        Eip3009Token::new(asset, self.client.clone())
            .authorization_state(authorizer, nonce)
            .call()
            .await
            .map_err(|e| format!("authorizationState query failed: {}", e))
    }

    async fn submit(&self, call: &TransferCall) -> std::result::Result<SubmittedTransfer, String> {
        let token = Eip3009Token::new(call.asset, self.client.clone());
        let auth = &call.authorization;
        let tx = token.transfer_with_authorization(
            auth.from,
            auth.to,
            auth.value,
            auth.valid_after,
            auth.valid_before,
            auth.nonce,
            call.signature.v,
            call.signature.r,
            call.signature.s,
        );
        let pending = tx
            .send()
            .await
            .map_err(|e| format!("transaction submission failed: {}", e))?;
        let tx_hash = pending.tx_hash();
        debug!(transaction = ?tx_hash, "transferWithAuthorization submitted");
        let receipt = pending
            .confirmations(self.confirmations)
            .await
            .map_err(|e| format!("receipt for {:?} unavailable: {}", tx_hash, e))?
            .ok_or_else(|| format!("transaction {:?} dropped from mempool", tx_hash))?;
        Ok(SubmittedTransfer {
            transaction: format!("{:?}", receipt.transaction_hash),
            succeeded: receipt.status == Some(U64::from(1)),
        })
    }
}

/// Settles by submitting the payer's authorization to the asset contract.
pub struct DirectSettlement<S = EthersSubmitter> {
    submitter: S,
}

impl<S: TransferSubmitter> DirectSettlement<S> {
    pub fn new(submitter: S) -> Self {
        Self { submitter }
    }

    pub fn submitter(&self) -> &S {
        &self.submitter
    }

    /// Rebuild the exact call from the submitted payload. The payload was
    /// verified before reaching here; any parse failure is still a failure.
    pub fn transfer_call(
        envelope: &PaymentEnvelope,
        requirement: &PaymentRequirement,
    ) -> std::result::Result<TransferCall, String> {
        let auth = envelope.authorization();
        let authorization = TypedAuthorization {
            from: evm::parse_address(&auth.from)?,
            to: evm::parse_address(&auth.to)?,
            value: parse_decimal_u256(auth.value.trim())?,
            valid_after: parse_decimal_u256(auth.valid_after.trim())?,
            valid_before: parse_decimal_u256(auth.valid_before.trim())?,
            nonce: evm::parse_nonce(&auth.nonce)?,
        };
        Ok(TransferCall {
            asset: requirement.asset,
            authorization,
            signature: evm::split_signature(&envelope.payload.signature)?,
        })
    }
}

#[async_trait]
impl<S: TransferSubmitter> SettlementStrategy for DirectSettlement<S> {
    async fn settle(
        &self,
        envelope: &PaymentEnvelope,
        requirement: &PaymentRequirement,
    ) -> SettlementOutcome {
        let network = requirement.network.as_str();
        let call = match Self::transfer_call(envelope, requirement) {
            Ok(call) => call,
            Err(reason) => {
                return SettlementOutcome::failed(
                    format!("cannot build transfer: {}", reason),
                    network,
                    None,
                );
            }
        };
        let payer = Some(call.authorization.from);

        match self
            .submitter
            .authorization_used(call.asset, call.authorization.from, call.authorization.nonce)
            .await
        {
            Ok(true) => {
                return SettlementOutcome::failed("authorization already used", network, payer);
            }
            Ok(false) => {}
            // submission reverts on a used nonce anyway
            Err(reason) => warn!("{}", reason),
        }

        match self.submitter.submit(&call).await {
            Ok(SubmittedTransfer {
                transaction,
                succeeded: true,
            }) => SettlementOutcome::Settled {
                transaction,
                network: network.to_string(),
                payer,
            },
            Ok(SubmittedTransfer { transaction, .. }) => {
                warn!(%transaction, "transferWithAuthorization reverted");
                SettlementOutcome::failed("transaction reverted", network, payer)
            }
            Err(reason) => SettlementOutcome::failed(reason, network, payer),
        }
    }

    fn name(&self) -> &str {
        "direct"
    }
}
