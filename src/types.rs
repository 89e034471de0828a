/// Type definitions for global use.
use crate::error::Error;
use crate::verifier::evm;
use ethers::types::{Address, U256};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Protocol version spoken on the wire.
pub const X402_VERSION: u8 = 1;

/// The only scheme this gate settles: a fixed-amount EIP-3009 transfer.
pub const EXACT_SCHEME: &str = "exact";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EvmNetwork {
    Ethereum,
    Sepolia,
    Base,
    BaseSepolia,
    Polygon,
    PolygonAmoy,
    Arbitrum,
    Optimism,
    Avalanche,
    AvalancheFuji,
    BinanceSmartChain,
    Custom { name: String, chain_id: u64 },
}

impl EvmNetwork {
    pub fn custom(name: impl Into<String>, chain_id: u64) -> Self {
        EvmNetwork::Custom {
            name: name.into(),
            chain_id,
        }
    }

    pub fn base() -> Self {
        EvmNetwork::Base
    }

    pub fn base_sepolia() -> Self {
        EvmNetwork::BaseSepolia
    }

    pub fn chain_id(&self) -> u64 {
        match self {
            EvmNetwork::Ethereum => 1,
            EvmNetwork::Sepolia => 11_155_111,
            EvmNetwork::Base => 8453,
            EvmNetwork::BaseSepolia => 84532,
            EvmNetwork::Polygon => 137,
            EvmNetwork::PolygonAmoy => 80002,
            EvmNetwork::Arbitrum => 42161,
            EvmNetwork::Optimism => 10,
            EvmNetwork::Avalanche => 43114,
            EvmNetwork::AvalancheFuji => 43113,
            EvmNetwork::BinanceSmartChain => 56,
            EvmNetwork::Custom { chain_id, .. } => *chain_id,
        }
    }

    /// Network identifier as it appears in requirements and payloads.
    pub fn as_str(&self) -> &str {
        match self {
            EvmNetwork::Ethereum => "ethereum",
            EvmNetwork::Sepolia => "sepolia",
            EvmNetwork::Base => "base",
            EvmNetwork::BaseSepolia => "base-sepolia",
            EvmNetwork::Polygon => "polygon",
            EvmNetwork::PolygonAmoy => "polygon-amoy",
            EvmNetwork::Arbitrum => "arbitrum",
            EvmNetwork::Optimism => "optimism",
            EvmNetwork::Avalanche => "avalanche",
            EvmNetwork::AvalancheFuji => "avalanche-fuji",
            EvmNetwork::BinanceSmartChain => "bsc",
            EvmNetwork::Custom { name, .. } => name,
        }
    }

    pub fn get_display_name(&self) -> String {
        match self {
            EvmNetwork::Ethereum => "Ethereum",
            EvmNetwork::Sepolia => "Ethereum Sepolia",
            EvmNetwork::Base => "Base",
            EvmNetwork::BaseSepolia => "Base Sepolia",
            EvmNetwork::Polygon => "Polygon",
            EvmNetwork::PolygonAmoy => "Polygon Amoy",
            EvmNetwork::Arbitrum => "Arbitrum",
            EvmNetwork::Optimism => "Optimism",
            EvmNetwork::Avalanche => "Avalanche",
            EvmNetwork::AvalancheFuji => "Avalanche Fuji",
            EvmNetwork::BinanceSmartChain => "BNB Smart Chain",
            EvmNetwork::Custom { name, .. } => name,
        }
        .to_string()
    }

    pub fn is_testnet(&self) -> bool {
        matches!(
            self,
            EvmNetwork::Sepolia
                | EvmNetwork::BaseSepolia
                | EvmNetwork::PolygonAmoy
                | EvmNetwork::AvalancheFuji
        )
    }
}

impl FromStr for EvmNetwork {
    type Err = Error;

    /// Accepts the known network names and CAIP-2 `eip155:<chain id>` identifiers.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let network = match s {
            "ethereum" | "mainnet" => EvmNetwork::Ethereum,
            "sepolia" => EvmNetwork::Sepolia,
            "base" => EvmNetwork::Base,
            "base-sepolia" => EvmNetwork::BaseSepolia,
            "polygon" => EvmNetwork::Polygon,
            "polygon-amoy" => EvmNetwork::PolygonAmoy,
            "arbitrum" => EvmNetwork::Arbitrum,
            "optimism" => EvmNetwork::Optimism,
            "avalanche" => EvmNetwork::Avalanche,
            "avalanche-fuji" => EvmNetwork::AvalancheFuji,
            "bsc" => EvmNetwork::BinanceSmartChain,
            other => {
                let chain_id = other
                    .strip_prefix("eip155:")
                    .and_then(|id| id.parse::<u64>().ok())
                    .ok_or_else(|| Error::Config(format!("unknown network: {other}")))?;
                EvmNetwork::custom(other, chain_id)
            }
        };
        Ok(network)
    }
}

impl fmt::Display for EvmNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EvmNetwork {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EvmNetwork {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse().map_err(serde::de::Error::custom)
    }
}

/// Token metadata that parameterizes the EIP-712 signing domain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssetMetadata {
    pub name: String,
    pub version: String,
}

impl Default for AssetMetadata {
    fn default() -> Self {
        Self {
            name: "USD Coin".to_string(),
            version: "2".to_string(),
        }
    }
}

/// What a protected resource costs, advertised in every 402 response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirement {
    pub scheme: String,
    pub network: EvmNetwork,
    #[serde(with = "decimal_u256")]
    pub max_amount_required: U256,
    pub resource: String,
    pub description: String,
    pub mime_type: String,
    pub pay_to: Address,
    pub max_timeout_seconds: u64,
    pub asset: Address,
    pub extra: AssetMetadata,
}

impl PaymentRequirement {
    pub fn exact(
        network: EvmNetwork,
        asset: Address,
        pay_to: Address,
        max_amount_required: U256,
        resource: impl Into<String>,
    ) -> Self {
        let resource = resource.into();
        Self {
            scheme: EXACT_SCHEME.to_string(),
            network,
            max_amount_required,
            description: format!("Access to: {}", resource),
            resource,
            mime_type: "application/json".to_string(),
            pay_to,
            max_timeout_seconds: 60,
            asset,
            extra: AssetMetadata::default(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_asset_metadata(mut self, name: &str, version: &str) -> Self {
        self.extra = AssetMetadata {
            name: name.to_string(),
            version: version.to_string(),
        };
        self
    }

    pub fn with_max_timeout(mut self, seconds: u64) -> Self {
        self.max_timeout_seconds = seconds;
        self
    }
}

/// The signed EIP-3009 authorization fields, kept verbatim as submitted.
///
/// Numbers stay strings until the verifier parses them, so a malformed value
/// becomes a rejection reason instead of a deserialization failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TransferAuthorization {
    pub from: String,
    pub to: String,
    #[serde(deserialize_with = "string_or_number")]
    pub value: String,
    #[serde(deserialize_with = "string_or_number")]
    pub valid_after: String,
    #[serde(deserialize_with = "string_or_number")]
    pub valid_before: String,
    pub nonce: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExactEvmPayload {
    pub signature: String,
    pub authorization: TransferAuthorization,
}

/// A submitted payment, as decoded from the `X-PAYMENT` header or request body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PaymentEnvelope {
    pub x402_version: u8,
    pub scheme: String,
    pub network: String,
    pub payload: ExactEvmPayload,
}

impl PaymentEnvelope {
    pub fn authorization(&self) -> &TransferAuthorization {
        &self.payload.authorization
    }

    /// Canonical idempotency key for this authorization.
    ///
    /// SHA-256 over the sorted `key=value` lines of the scheme, network and
    /// authorization fields. Fields are keyed by the values they decode to,
    /// not by their spelling: addresses and the nonce go through the same
    /// parsers the verifier uses and decimals lose leading zeros, so every
    /// accepted spelling of one authorization collides. The signature is left
    /// out: it is malleable, the authorization is not.
    pub fn fingerprint(&self) -> String {
        let auth = self.authorization();
        let canonical = BTreeMap::from([
            ("scheme", self.scheme.clone()),
            ("network", self.network.clone()),
            ("from", canonical_address(&auth.from)),
            ("to", canonical_address(&auth.to)),
            ("value", canonical_decimal(&auth.value)),
            ("validAfter", canonical_decimal(&auth.valid_after)),
            ("validBefore", canonical_decimal(&auth.valid_before)),
            ("nonce", canonical_nonce(&auth.nonce)),
        ]);
        let mut hasher = Sha256::new();
        for (key, value) in &canonical {
            hasher.update(key.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }
}

// Values that do not parse can never verify; they keep a lowercased raw form.
fn canonical_address(raw: &str) -> String {
    evm::parse_address(raw)
        .map(|address| address_hex(&address))
        .unwrap_or_else(|_| raw.trim().to_lowercase())
}

fn canonical_nonce(raw: &str) -> String {
    evm::parse_nonce(raw)
        .map(|nonce| format!("0x{}", hex::encode(nonce)))
        .unwrap_or_else(|_| raw.trim().to_lowercase())
}

fn canonical_decimal(raw: &str) -> String {
    parse_decimal_u256(raw.trim())
        .map(|value| value.to_string())
        .unwrap_or_else(|_| raw.trim().to_string())
}

/// Why the verifier refused an authorization.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidReason {
    #[error("malformed payment payload: {0}")]
    Malformed(String),
    #[error("network mismatch")]
    NetworkMismatch,
    #[error("recipient mismatch")]
    RecipientMismatch,
    #[error("invalid amount")]
    InvalidAmount,
    #[error("insufficient amount")]
    InsufficientAmount,
    #[error("invalid authorization window")]
    InvalidWindow,
    #[error("authorization not yet valid")]
    NotYetValid,
    #[error("authorization expired")]
    Expired,
    #[error("signature verification failed: {0}")]
    SignatureFailed(String),
    #[error("signature does not match payer")]
    SignerMismatch,
    /// Reason reported by a remote settlement service's verify endpoint.
    #[error("{0}")]
    Remote(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationOutcome {
    /// `payer` is the recovered signer, never the caller-supplied `from`.
    Valid { payer: Address },
    Invalid { reason: InvalidReason },
}

impl VerificationOutcome {
    pub fn invalid(reason: InvalidReason) -> Self {
        VerificationOutcome::Invalid { reason }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, VerificationOutcome::Valid { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettlementOutcome {
    Settled {
        transaction: String,
        network: String,
        payer: Option<Address>,
    },
    Failed {
        reason: String,
        network: String,
        payer: Option<Address>,
    },
}

impl SettlementOutcome {
    pub fn failed(reason: impl Into<String>, network: &str, payer: Option<Address>) -> Self {
        SettlementOutcome::Failed {
            reason: reason.into(),
            network: network.to_string(),
            payer,
        }
    }

    pub fn is_settled(&self) -> bool {
        matches!(self, SettlementOutcome::Settled { .. })
    }

    pub fn network(&self) -> &str {
        match self {
            SettlementOutcome::Settled { network, .. } | SettlementOutcome::Failed { network, .. } => {
                network
            }
        }
    }
}

/// Settlement result as exchanged with settlement services and returned to
/// clients in the `X-PAYMENT-RESPONSE` header.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SettleResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
    #[serde(default)]
    pub transaction: String,
    #[serde(default)]
    pub network: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payer: Option<String>,
}

/// Body of a "402 Payment Required" answer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequiredResponse {
    pub x402_version: u8,
    pub error: String,
    pub accepts: Vec<PaymentRequirement>,
}

impl PaymentRequiredResponse {
    pub fn new(requirement: &PaymentRequirement, error: impl Into<String>) -> Self {
        Self {
            x402_version: X402_VERSION,
            error: error.into(),
            accepts: vec![requirement.clone()],
        }
    }
}

/// current unix timestamp in seconds
pub fn current_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Lowercase `0x`-prefixed hex form of an address.
pub fn address_hex(address: &Address) -> String {
    format!("{:?}", address)
}

fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(serde_json::Number),
    }
    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(text) => text,
        Raw::Number(number) => number.to_string(),
    })
}

/// Serde adapter writing a `U256` as a decimal string.
pub mod decimal_u256 {
    use ethers::types::U256;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
        let raw = super::string_or_number(deserializer)?;
        super::parse_decimal_u256(&raw).map_err(serde::de::Error::custom)
    }
}

/// Parses a non-negative base-10 integer. Signs, blanks and hex are refused.
pub fn parse_decimal_u256(raw: &str) -> Result<U256, String> {
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format!("not a non-negative integer: {:?}", raw));
    }
    U256::from_dec_str(raw).map_err(|e| format!("integer out of range: {:?}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(json: &str) -> PaymentEnvelope {
        serde_json::from_str(json).expect("valid envelope")
    }

    #[test]
    fn test_network_names_and_chain_ids() {
        assert_eq!("base".parse::<EvmNetwork>().unwrap(), EvmNetwork::Base);
        assert_eq!(EvmNetwork::BaseSepolia.chain_id(), 84532);
        let caip: EvmNetwork = "eip155:31337".parse().unwrap();
        assert_eq!(caip.chain_id(), 31337);
        assert_eq!(caip.as_str(), "eip155:31337");
        assert!("chain-A".parse::<EvmNetwork>().is_err());
        assert_eq!(EvmNetwork::custom("chain-A", 7).as_str(), "chain-A");
    }

    #[test]
    fn test_requirement_wire_format() {
        let requirement = PaymentRequirement::exact(
            EvmNetwork::BaseSepolia,
            Address::repeat_byte(0xaa),
            Address::repeat_byte(0xbb),
            U256::from(100_000u64),
            "https://api.example.com/mint",
        );
        let json = serde_json::to_value(&requirement).unwrap();
        assert_eq!(json["maxAmountRequired"], "100000");
        assert_eq!(json["network"], "base-sepolia");
        assert_eq!(json["extra"]["version"], "2");

        let back: PaymentRequirement = serde_json::from_value(json).unwrap();
        assert_eq!(back, requirement);
    }

    #[test]
    fn test_fingerprint_ignores_field_order_and_case() {
        let a = envelope(
            r#"{"x402Version":1,"scheme":"exact","network":"base","payload":{"signature":"0x01",
            "authorization":{"from":"0xABCD","to":"0xEF01","value":"100","validAfter":"0",
            "validBefore":"99","nonce":"0xAA"}}}"#,
        );
        let b = envelope(
            r#"{"payload":{"authorization":{"nonce":"0xaa","validBefore":99,"validAfter":"0",
            "value":"0100","to":"0xef01","from":"0xabcd"},"signature":"0x02"},
            "network":"base","scheme":"exact","x402Version":1}"#,
        );
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);
    }

    #[test]
    fn test_fingerprint_ignores_hex_prefix() {
        let prefixed = envelope(&format!(
            r#"{{"x402Version":1,"scheme":"exact","network":"base","payload":{{"signature":"0x01",
            "authorization":{{"from":"0x{from}","to":"0x{to}","value":"100","validAfter":"0",
            "validBefore":"99","nonce":"0x{nonce}"}}}}}}"#,
            from = "f39fd6e51aad88f6f4ce6ab8827279cfffb92266",
            to = "4d".repeat(20),
            nonce = "ab".repeat(32),
        ));
        let mut bare = prefixed.clone();
        bare.payload.authorization.nonce = "AB".repeat(32);
        assert_eq!(prefixed.fingerprint(), bare.fingerprint());

        bare.payload.authorization.from = "F39FD6E51AAD88F6F4CE6AB8827279CFFFB92266".to_string();
        bare.payload.authorization.to = "0X".to_string() + &"4D".repeat(20);
        assert_eq!(prefixed.fingerprint(), bare.fingerprint());
    }

    #[test]
    fn test_fingerprint_changes_with_nonce() {
        let mut a = envelope(
            r#"{"x402Version":1,"scheme":"exact","network":"base","payload":{"signature":"0x01",
            "authorization":{"from":"0xab","to":"0xcd","value":"1","validAfter":"0",
            "validBefore":"9","nonce":"0x01"}}}"#,
        );
        let before = a.fingerprint();
        a.payload.authorization.nonce = "0x02".to_string();
        assert_ne!(before, a.fingerprint());
    }

    #[test]
    fn test_parse_decimal_rejects_signs_and_garbage() {
        assert_eq!(parse_decimal_u256("42").unwrap(), U256::from(42));
        assert!(parse_decimal_u256("-1").is_err());
        assert!(parse_decimal_u256("+1").is_err());
        assert!(parse_decimal_u256("").is_err());
        assert!(parse_decimal_u256("0x10").is_err());
        assert!(parse_decimal_u256("1.5").is_err());
    }
}
