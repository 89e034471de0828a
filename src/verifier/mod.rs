use crate::types::{
    InvalidReason, PaymentEnvelope, PaymentRequirement, VerificationOutcome, address_hex,
    current_timestamp, parse_decimal_u256,
};
use async_trait::async_trait;
use ethers::types::U256;
use tracing::debug;

pub mod evm;

use evm::TypedAuthorization;

/// Checks a signed authorization against a requirement.
///
/// Implemented locally by [`LocalVerifier`] and remotely by
/// [`crate::settlement::facilitator::FacilitatorClient`]. Both must admit and
/// reject the same payloads.
#[async_trait]
pub trait PaymentVerifier: Send + Sync {
    async fn verify_payment(
        &self,
        envelope: &PaymentEnvelope,
        requirement: &PaymentRequirement,
    ) -> VerificationOutcome;

    fn name(&self) -> &str;
}

/// In-process verifier. No I/O beyond reading the clock.
#[derive(Debug, Clone)]
pub struct LocalVerifier {
    clock: fn() -> u64,
}

impl LocalVerifier {
    pub fn new() -> Self {
        Self {
            clock: current_timestamp,
        }
    }

    pub fn with_clock(clock: fn() -> u64) -> Self {
        Self { clock }
    }
}

impl Default for LocalVerifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PaymentVerifier for LocalVerifier {
    async fn verify_payment(
        &self,
        envelope: &PaymentEnvelope,
        requirement: &PaymentRequirement,
    ) -> VerificationOutcome {
        verify(envelope, requirement, (self.clock)())
    }

    fn name(&self) -> &str {
        "local"
    }
}

/// Validate `envelope` against `requirement` at unix time `now`.
///
/// Checks run in a fixed order and stop at the first failure:
/// scheme/network, recipient, amount, validity window, signature.
pub fn verify(
    envelope: &PaymentEnvelope,
    requirement: &PaymentRequirement,
    now: u64,
) -> VerificationOutcome {
    let auth = envelope.authorization();

    if envelope.scheme != requirement.scheme || envelope.network != requirement.network.as_str() {
        return VerificationOutcome::invalid(InvalidReason::NetworkMismatch);
    }

    if !auth
        .to
        .trim()
        .eq_ignore_ascii_case(&address_hex(&requirement.pay_to))
    {
        return VerificationOutcome::invalid(InvalidReason::RecipientMismatch);
    }

    let value = match parse_decimal_u256(auth.value.trim()) {
        Ok(value) => value,
        Err(_) => return VerificationOutcome::invalid(InvalidReason::InvalidAmount),
    };
    if value < requirement.max_amount_required {
        return VerificationOutcome::invalid(InvalidReason::InsufficientAmount);
    }

    let (valid_after, valid_before) = match (
        parse_decimal_u256(auth.valid_after.trim()),
        parse_decimal_u256(auth.valid_before.trim()),
    ) {
        (Ok(after), Ok(before)) => (after, before),
        _ => return VerificationOutcome::invalid(InvalidReason::InvalidWindow),
    };
    let now_u256 = U256::from(now);
    if valid_after > now_u256 {
        return VerificationOutcome::invalid(InvalidReason::NotYetValid);
    }
    if now_u256 >= valid_before {
        return VerificationOutcome::invalid(InvalidReason::Expired);
    }

    let typed = match evm::parse_address(&auth.from)
        .and_then(|from| evm::parse_nonce(&auth.nonce).map(|nonce| (from, nonce)))
    {
        Ok((from, nonce)) => TypedAuthorization {
            from,
            to: requirement.pay_to,
            value,
            valid_after,
            valid_before,
            nonce,
        },
        Err(detail) => return VerificationOutcome::invalid(InvalidReason::SignatureFailed(detail)),
    };

    let recovered = match evm::recover_signer(requirement, &typed, &envelope.payload.signature) {
        Ok(address) => address,
        Err(detail) => return VerificationOutcome::invalid(InvalidReason::SignatureFailed(detail)),
    };
    if recovered != typed.from {
        debug!(
            claimed = %address_hex(&typed.from),
            recovered = %address_hex(&recovered),
            "signer does not match claimed payer"
        );
        return VerificationOutcome::invalid(InvalidReason::SignerMismatch);
    }

    VerificationOutcome::Valid { payer: recovered }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        EXACT_SCHEME, EvmNetwork, ExactEvmPayload, TransferAuthorization, X402_VERSION,
    };
    use ethers::signers::{LocalWallet, Signer};
    use ethers::types::Address;

    const PAYER_KEY: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const OTHER_KEY: &str = "59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d";
    const NOW: u64 = 1_700_000_000;

    fn merchant() -> Address {
        Address::repeat_byte(0x4d)
    }

    /// chain-A / 0xAsset / 0xMerchant, 100000 atomic units.
    fn requirement() -> PaymentRequirement {
        PaymentRequirement::exact(
            EvmNetwork::custom("chain-A", 31337),
            Address::repeat_byte(0xa5),
            merchant(),
            U256::from(100_000u64),
            "https://api.example.com/mint",
        )
    }

    fn signed(wallet: &LocalWallet, from: Address, value: u64, after: u64, before: u64) -> PaymentEnvelope {
        let requirement = requirement();
        let typed = TypedAuthorization {
            from,
            to: merchant(),
            value: U256::from(value),
            valid_after: U256::from(after),
            valid_before: U256::from(before),
            nonce: [9u8; 32],
        };
        let signature = evm::sign_authorization(wallet, &requirement, &typed).unwrap();
        PaymentEnvelope {
            x402_version: X402_VERSION,
            scheme: EXACT_SCHEME.to_string(),
            network: "chain-A".to_string(),
            payload: ExactEvmPayload {
                signature,
                authorization: TransferAuthorization {
                    from: address_hex(&from),
                    to: address_hex(&merchant()),
                    value: value.to_string(),
                    valid_after: after.to_string(),
                    valid_before: before.to_string(),
                    nonce: format!("0x{}", hex::encode([9u8; 32])),
                },
            },
        }
    }

    fn payer() -> LocalWallet {
        PAYER_KEY.parse().unwrap()
    }

    fn valid_envelope() -> PaymentEnvelope {
        let wallet = payer();
        signed(&wallet, wallet.address(), 100_000, NOW - 10, NOW + 60)
    }

    fn reason(outcome: VerificationOutcome) -> InvalidReason {
        match outcome {
            VerificationOutcome::Invalid { reason } => reason,
            other => panic!("expected invalid, got {:?}", other),
        }
    }

    #[test]
    fn test_exact_amount_is_valid() {
        let outcome = verify(&valid_envelope(), &requirement(), NOW);
        assert_eq!(
            outcome,
            VerificationOutcome::Valid {
                payer: payer().address()
            }
        );
    }

    #[test]
    fn test_insufficient_amount() {
        let wallet = payer();
        let envelope = signed(&wallet, wallet.address(), 50_000, NOW - 10, NOW + 60);
        assert_eq!(
            reason(verify(&envelope, &requirement(), NOW)),
            InvalidReason::InsufficientAmount
        );
    }

    #[test]
    fn test_overpayment_is_accepted() {
        let wallet = payer();
        let envelope = signed(&wallet, wallet.address(), 100_001, NOW - 10, NOW + 60);
        assert!(verify(&envelope, &requirement(), NOW).is_valid());
    }

    #[test]
    fn test_window_bounds() {
        let wallet = payer();
        let expired = signed(&wallet, wallet.address(), 100_000, NOW - 100, NOW);
        assert_eq!(reason(verify(&expired, &requirement(), NOW)), InvalidReason::Expired);

        let early = signed(&wallet, wallet.address(), 100_000, NOW + 1, NOW + 100);
        assert_eq!(reason(verify(&early, &requirement(), NOW)), InvalidReason::NotYetValid);

        let starts_now = signed(&wallet, wallet.address(), 100_000, NOW, NOW + 1);
        assert!(verify(&starts_now, &requirement(), NOW).is_valid());
    }

    #[test]
    fn test_claimed_payer_must_match_signer() {
        let signer = payer();
        let other: LocalWallet = OTHER_KEY.parse().unwrap();
        // signed by `signer` while claiming to be `other`
        let envelope = signed(&signer, other.address(), 100_000, NOW - 10, NOW + 60);
        assert_eq!(
            reason(verify(&envelope, &requirement(), NOW)),
            InvalidReason::SignerMismatch
        );
    }

    #[test]
    fn test_rewritten_from_is_rejected() {
        let mut envelope = valid_envelope();
        let other: LocalWallet = OTHER_KEY.parse().unwrap();
        envelope.payload.authorization.from = address_hex(&other.address());
        assert!(!verify(&envelope, &requirement(), NOW).is_valid());
    }

    #[test]
    fn test_recipient_compare_ignores_case() {
        let mut envelope = valid_envelope();
        envelope.payload.authorization.to = envelope.payload.authorization.to.to_uppercase().replace("0X", "0x");
        assert!(verify(&envelope, &requirement(), NOW).is_valid());

        envelope.payload.authorization.to = address_hex(&Address::repeat_byte(0x01));
        assert_eq!(
            reason(verify(&envelope, &requirement(), NOW)),
            InvalidReason::RecipientMismatch
        );
    }

    #[test]
    fn test_network_and_scheme_mismatch() {
        let mut envelope = valid_envelope();
        envelope.network = "base".to_string();
        assert_eq!(reason(verify(&envelope, &requirement(), NOW)), InvalidReason::NetworkMismatch);

        let mut envelope = valid_envelope();
        envelope.scheme = "upto".to_string();
        assert_eq!(reason(verify(&envelope, &requirement(), NOW)), InvalidReason::NetworkMismatch);
    }

    #[test]
    fn test_malformed_numbers() {
        let mut envelope = valid_envelope();
        envelope.payload.authorization.value = "-100000".to_string();
        assert_eq!(reason(verify(&envelope, &requirement(), NOW)), InvalidReason::InvalidAmount);

        let mut envelope = valid_envelope();
        envelope.payload.authorization.valid_before = "soon".to_string();
        assert_eq!(reason(verify(&envelope, &requirement(), NOW)), InvalidReason::InvalidWindow);
    }

    #[test]
    fn test_garbage_signature() {
        let mut envelope = valid_envelope();
        envelope.payload.signature = "0x1234".to_string();
        assert!(matches!(
            reason(verify(&envelope, &requirement(), NOW)),
            InvalidReason::SignatureFailed(_)
        ));
    }

    #[test]
    fn test_checks_run_in_order() {
        // wrong network and insufficient amount: network wins
        let wallet = payer();
        let mut envelope = signed(&wallet, wallet.address(), 1, NOW + 100, NOW + 200);
        envelope.network = "base".to_string();
        assert_eq!(reason(verify(&envelope, &requirement(), NOW)), InvalidReason::NetworkMismatch);

        envelope.network = "chain-A".to_string();
        assert_eq!(
            reason(verify(&envelope, &requirement(), NOW)),
            InvalidReason::InsufficientAmount
        );
    }

    #[tokio::test]
    async fn test_local_verifier_uses_clock() {
        fn frozen() -> u64 {
            NOW
        }
        let verifier = LocalVerifier::with_clock(frozen);
        let outcome = verifier.verify_payment(&valid_envelope(), &requirement()).await;
        assert!(outcome.is_valid());
        assert_eq!(verifier.name(), "local");
    }
}
