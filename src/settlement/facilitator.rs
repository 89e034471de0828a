/// Remote settlement: delegate verify/settle to an x402 facilitator service.
use crate::error::{Error, Result};
use crate::settlement::SettlementStrategy;
use crate::types::{
    InvalidReason, PaymentEnvelope, PaymentRequirement, SettleResponse, SettlementOutcome,
    VerificationOutcome, X402_VERSION,
};
use crate::verifier::PaymentVerifier;
use crate::verifier::evm::parse_address;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

#[derive(Debug, Clone)]
pub struct FacilitatorConfig {
    /// Base URL; `verify` and `settle` are resolved relative to it.
    pub url: Url,
    /// Per-request timeout. Settlement on-chain can take several seconds.
    pub timeout: Duration,
}

impl FacilitatorConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FacilitatorRequest<'a> {
    x402_version: u8,
    payment_payload: &'a PaymentEnvelope,
    payment_requirements: &'a PaymentRequirement,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifyResponse {
    is_valid: bool,
    #[serde(default)]
    invalid_reason: Option<String>,
    #[serde(default)]
    payer: Option<String>,
}

/// HTTP client for a remote facilitator.
///
/// Serves both as a [`SettlementStrategy`] and, when local verification is not
/// wanted, as a [`PaymentVerifier`].
#[derive(Debug, Clone)]
pub struct FacilitatorClient {
    client: reqwest::Client,
    verify_url: Url,
    settle_url: Url,
}

impl FacilitatorClient {
    pub fn new(config: FacilitatorConfig) -> Result<Self> {
        let mut base = config.url;
        // `Url::join` drops the last segment unless the path ends in '/'
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let verify_url = base
            .join("verify")
            .map_err(|e| Error::Config(format!("invalid facilitator url: {}", e)))?;
        let settle_url = base
            .join("settle")
            .map_err(|e| Error::Config(format!("invalid facilitator url: {}", e)))?;
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Network(format!("failed to build http client: {}", e)))?;
        Ok(Self {
            client,
            verify_url,
            settle_url,
        })
    }

    pub fn from_url(url: &str) -> Result<Self> {
        let url = Url::parse(url)
            .map_err(|e| Error::Config(format!("invalid facilitator url {}: {}", url, e)))?;
        Self::new(FacilitatorConfig::new(url))
    }

    async fn post<T: DeserializeOwned>(
        &self,
        url: &Url,
        envelope: &PaymentEnvelope,
        requirement: &PaymentRequirement,
    ) -> std::result::Result<T, String> {
        let request = FacilitatorRequest {
            x402_version: X402_VERSION,
            payment_payload: envelope,
            payment_requirements: requirement,
        };
        let response = self
            .client
            .post(url.clone())
            .json(&request)
            .send()
            .await
            .map_err(|e| format!("facilitator request failed: {}", e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(format!("facilitator returned {}: {}", status, body.trim()));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| format!("invalid facilitator response: {}", e))
    }

    pub async fn verify(
        &self,
        envelope: &PaymentEnvelope,
        requirement: &PaymentRequirement,
    ) -> VerificationOutcome {
        let response: VerifyResponse = match self.post(&self.verify_url, envelope, requirement).await
        {
            Ok(response) => response,
            Err(reason) => {
                warn!("remote verification unavailable: {}", reason);
                return VerificationOutcome::invalid(InvalidReason::Remote(reason));
            }
        };
        if !response.is_valid {
            let reason = response
                .invalid_reason
                .unwrap_or_else(|| "rejected by facilitator".to_string());
            return VerificationOutcome::invalid(InvalidReason::Remote(reason));
        }
        // A positive answer means the facilitator recovered the signer and found it equal to `from`.
        let payer = response
            .payer
            .as_deref()
            .unwrap_or(&envelope.authorization().from);
        match parse_address(payer) {
            Ok(payer) => VerificationOutcome::Valid { payer },
            Err(detail) => VerificationOutcome::invalid(InvalidReason::Remote(detail)),
        }
    }

    pub async fn settle(
        &self,
        envelope: &PaymentEnvelope,
        requirement: &PaymentRequirement,
    ) -> SettlementOutcome {
        let network = requirement.network.as_str();
        let claimed = parse_address(&envelope.authorization().from).ok();
        let response: SettleResponse = match self.post(&self.settle_url, envelope, requirement).await
        {
            Ok(response) => response,
            Err(reason) => return SettlementOutcome::failed(reason, network, claimed),
        };
        let payer = response
            .payer
            .as_deref()
            .and_then(|p| parse_address(p).ok())
            .or(claimed);
        let network = if response.network.is_empty() {
            network.to_string()
        } else {
            response.network
        };
        if !response.success {
            let reason = response
                .error_reason
                .unwrap_or_else(|| "settlement rejected by facilitator".to_string());
            return SettlementOutcome::Failed {
                reason,
                network,
                payer,
            };
        }
        if response.transaction.is_empty() {
            // success without a transaction reference is not provably settled
            return SettlementOutcome::Failed {
                reason: "facilitator reported success without a transaction".to_string(),
                network,
                payer,
            };
        }
        debug!(transaction = %response.transaction, "facilitator settled payment");
        SettlementOutcome::Settled {
            transaction: response.transaction,
            network,
            payer,
        }
    }
}

#[async_trait]
impl SettlementStrategy for FacilitatorClient {
    async fn settle(
        &self,
        envelope: &PaymentEnvelope,
        requirement: &PaymentRequirement,
    ) -> SettlementOutcome {
        FacilitatorClient::settle(self, envelope, requirement).await
    }

    fn name(&self) -> &str {
        "facilitator"
    }
}

#[async_trait]
impl PaymentVerifier for FacilitatorClient {
    async fn verify_payment(
        &self,
        envelope: &PaymentEnvelope,
        requirement: &PaymentRequirement,
    ) -> VerificationOutcome {
        self.verify(envelope, requirement).await
    }

    fn name(&self) -> &str {
        "facilitator"
    }
}
