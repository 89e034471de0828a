/// Configuration module
use crate::error::{Error, Result};
use crate::policy::Policy;
use crate::types::{AssetMetadata, EvmNetwork, PaymentRequirement, parse_decimal_u256};
use crate::verifier::evm::parse_address;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Private key material. Never printed, never serialized.
#[derive(Clone)]
pub struct SecretKey(String);

impl SecretKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(***)")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateConfig {
    pub service: ServiceConfig,
    pub payment: PaymentConfig,
    pub settlement: SettlementConfig,
    #[serde(default)]
    pub verification: VerificationMode,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub allowlist: AllowListConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    pub name: String,
    pub description: String,
    pub resource: String,
    pub mime_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentConfig {
    pub network: String,
    /// Required for networks the gate does not know by name.
    #[serde(default)]
    pub chain_id: Option<u64>,
    pub asset: String,
    pub asset_name: String,
    pub asset_version: String,
    pub pay_to: String,
    pub max_amount_required: String,
    pub max_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum SettlementConfig {
    #[serde(rename_all = "camelCase")]
    Facilitator { url: String, timeout_secs: u64 },
    /// The signing key comes from `X402_SIGNER_PRIVATE_KEY` only.
    #[serde(rename_all = "camelCase")]
    Direct {
        rpc_url: String,
        confirmations: usize,
        timeout_secs: u64,
    },
}

impl SettlementConfig {
    pub fn timeout(&self) -> Duration {
        match self {
            SettlementConfig::Facilitator { timeout_secs, .. }
            | SettlementConfig::Direct { timeout_secs, .. } => Duration::from_secs(*timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VerificationMode {
    #[default]
    Local,
    Facilitator,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerConfig {
    /// `None` keeps the ledger in memory only.
    pub idempotency_path: Option<PathBuf>,
    pub quota_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyConfig {
    pub path: Option<PathBuf>,
    pub ttl_secs: u64,
    pub eligibility_gate_enabled: bool,
    pub per_identity_limit: Option<u64>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            path: None,
            ttl_secs: 5,
            eligibility_gate_enabled: false,
            per_identity_limit: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllowListConfig {
    pub path: Option<PathBuf>,
    pub ttl_secs: u64,
}

impl Default for AllowListConfig {
    fn default() -> Self {
        Self {
            path: None,
            ttl_secs: 30,
        }
    }
}

pub struct ConfigManager {
    config: GateConfig,
    environment: HashMap<String, String>,
}

impl ConfigManager {
    pub fn new() -> Result<Self> {
        Ok(Self {
            config: Self::default_config(),
            environment: Self::load_environment_variables(),
        })
    }

    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Configuration file {} unreadable: {}", path, e)))?;
        let config: GateConfig = serde_json::from_str(&content)?;
        Ok(Self {
            config,
            environment: Self::load_environment_variables(),
        })
    }

    pub fn from_config(config: GateConfig) -> Self {
        Self {
            config,
            environment: Self::load_environment_variables(),
        }
    }

    /// Replace the captured environment, mainly for tests.
    pub fn with_environment(mut self, environment: HashMap<String, String>) -> Self {
        self.environment = environment;
        self
    }

    pub fn get_config(&self) -> &GateConfig {
        &self.config
    }

    pub fn update_config<F>(&mut self, updater: F)
    where
        F: FnOnce(&mut GateConfig),
    {
        updater(&mut self.config);
    }

    fn env(&self, key: &str) -> Option<&str> {
        self.environment
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn network(&self) -> Result<EvmNetwork> {
        let name = self.env("X402_NETWORK").unwrap_or(self.config.payment.network.as_str());
        match name.parse::<EvmNetwork>() {
            Ok(network) => Ok(network),
            Err(err) => match self.config.payment.chain_id {
                Some(chain_id) => Ok(EvmNetwork::custom(name, chain_id)),
                None => Err(err),
            },
        }
    }

    /// The requirement advertised for the protected resource.
    pub fn payment_requirement(&self) -> Result<PaymentRequirement> {
        let payment = &self.config.payment;
        let asset = self.env("X402_ASSET").unwrap_or(payment.asset.as_str());
        let pay_to = self.env("X402_PAY_TO").unwrap_or(payment.pay_to.as_str());
        let amount = self
            .env("X402_MAX_AMOUNT")
            .unwrap_or(payment.max_amount_required.as_str());
        Ok(PaymentRequirement {
            scheme: crate::types::EXACT_SCHEME.to_string(),
            network: self.network()?,
            max_amount_required: parse_decimal_u256(amount)
                .map_err(|e| Error::Config(format!("maxAmountRequired: {}", e)))?,
            resource: self.config.service.resource.clone(),
            description: self.config.service.description.clone(),
            mime_type: self.config.service.mime_type.clone(),
            pay_to: parse_address(pay_to).map_err(|e| Error::Config(format!("payTo: {}", e)))?,
            max_timeout_seconds: payment.max_timeout_secs,
            asset: parse_address(asset).map_err(|e| Error::Config(format!("asset: {}", e)))?,
            extra: AssetMetadata {
                name: payment.asset_name.clone(),
                version: payment.asset_version.clone(),
            },
        })
    }

    pub fn settlement(&self) -> SettlementConfig {
        match &self.config.settlement {
            SettlementConfig::Facilitator { url, timeout_secs } => SettlementConfig::Facilitator {
                url: self.env("X402_FACILITATOR_URL").unwrap_or(url.as_str()).to_string(),
                timeout_secs: *timeout_secs,
            },
            SettlementConfig::Direct {
                rpc_url,
                confirmations,
                timeout_secs,
            } => SettlementConfig::Direct {
                rpc_url: self.env("RPC_URL").unwrap_or(rpc_url.as_str()).to_string(),
                confirmations: *confirmations,
                timeout_secs: *timeout_secs,
            },
        }
    }

    pub fn signer_key(&self) -> Option<SecretKey> {
        self.env("X402_SIGNER_PRIVATE_KEY").map(SecretKey::new)
    }

    /// Policy used whenever the policy document is missing or unreadable.
    pub fn default_policy(&self) -> Policy {
        let configured = Policy {
            eligibility_gate_enabled: self.config.policy.eligibility_gate_enabled,
            per_identity_limit: self.config.policy.per_identity_limit,
        };
        configured.with_environment(&self.environment)
    }

    fn load_environment_variables() -> HashMap<String, String> {
        std::env::vars()
            .filter(|(key, _)| key.starts_with("X402_") || key.starts_with("RPC_"))
            .collect()
    }

    fn default_config() -> GateConfig {
        GateConfig {
            service: ServiceConfig {
                name: "X402 Payment Gate".to_string(),
                description: "A service protected by x402 payment protocol".to_string(),
                resource: "https://api.example.com/mint".to_string(),
                mime_type: "application/json".to_string(),
            },
            payment: PaymentConfig {
                network: "base-sepolia".to_string(),
                chain_id: None,
                // USDC on Base Sepolia
                asset: "0x036CbD53842c5426634e7929541eC2318f3dCF7e".to_string(),
                asset_name: "USDC".to_string(),
                asset_version: "2".to_string(),
                pay_to: "0x0000000000000000000000000000000000000000".to_string(),
                max_amount_required: "10000".to_string(),
                max_timeout_secs: 60,
            },
            settlement: SettlementConfig::Facilitator {
                url: "https://x402.org/facilitator".to_string(),
                timeout_secs: 30,
            },
            verification: VerificationMode::Local,
            ledger: LedgerConfig::default(),
            policy: PolicyConfig::default(),
            allowlist: AllowListConfig::default(),
        }
    }
}

pub struct ConfigBuilder {
    config: GateConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ConfigManager::default_config(),
        }
    }

    pub fn with_service_name(mut self, name: &str) -> Self {
        self.config.service.name = name.to_string();
        self
    }

    pub fn with_resource(mut self, resource: &str) -> Self {
        self.config.service.resource = resource.to_string();
        self
    }

    pub fn with_network(mut self, network: &str, chain_id: Option<u64>) -> Self {
        self.config.payment.network = network.to_string();
        self.config.payment.chain_id = chain_id;
        self
    }

    pub fn with_asset(mut self, asset: &str, name: &str, version: &str) -> Self {
        self.config.payment.asset = asset.to_string();
        self.config.payment.asset_name = name.to_string();
        self.config.payment.asset_version = version.to_string();
        self
    }

    pub fn with_pay_to(mut self, pay_to: &str) -> Self {
        self.config.payment.pay_to = pay_to.to_string();
        self
    }

    pub fn with_payment_amount(mut self, amount: &str) -> Self {
        self.config.payment.max_amount_required = amount.to_string();
        self
    }

    pub fn with_facilitator(mut self, url: &str) -> Self {
        self.config.settlement = SettlementConfig::Facilitator {
            url: url.to_string(),
            timeout_secs: 30,
        };
        self
    }

    pub fn with_direct_settlement(mut self, rpc_url: &str) -> Self {
        self.config.settlement = SettlementConfig::Direct {
            rpc_url: rpc_url.to_string(),
            confirmations: 1,
            timeout_secs: 60,
        };
        self
    }

    pub fn with_verification(mut self, mode: VerificationMode) -> Self {
        self.config.verification = mode;
        self
    }

    pub fn with_ledger_paths(mut self, idempotency: PathBuf, quota: PathBuf) -> Self {
        self.config.ledger = LedgerConfig {
            idempotency_path: Some(idempotency),
            quota_path: Some(quota),
        };
        self
    }

    pub fn with_policy_file(mut self, path: PathBuf, ttl_secs: u64) -> Self {
        self.config.policy.path = Some(path);
        self.config.policy.ttl_secs = ttl_secs;
        self
    }

    pub fn with_allowlist_file(mut self, path: PathBuf, ttl_secs: u64) -> Self {
        self.config.allowlist = AllowListConfig {
            path: Some(path),
            ttl_secs,
        };
        self
    }

    pub fn build(self) -> GateConfig {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::U256;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_requirement_from_builder() {
        let config = ConfigBuilder::new()
            .with_network("chain-A", Some(31337))
            .with_pay_to("0x4d4d4d4d4d4d4d4d4d4d4d4d4d4d4d4d4d4d4d4d")
            .with_payment_amount("100000")
            .build();
        let manager = ConfigManager::from_config(config).with_environment(HashMap::new());
        let requirement = manager.payment_requirement().unwrap();
        assert_eq!(requirement.network.as_str(), "chain-A");
        assert_eq!(requirement.network.chain_id(), 31337);
        assert_eq!(requirement.max_amount_required, U256::from(100_000u64));
        assert_eq!(requirement.extra.name, "USDC");
    }

    #[test]
    fn test_unknown_network_without_chain_id() {
        let config = ConfigBuilder::new().with_network("chain-A", None).build();
        let manager = ConfigManager::from_config(config).with_environment(HashMap::new());
        assert!(matches!(manager.payment_requirement(), Err(Error::Config(_))));
    }

    #[test]
    fn test_environment_overrides() {
        let manager = ConfigManager::from_config(ConfigBuilder::new().build()).with_environment(env(&[
            ("X402_PAY_TO", "0x1111111111111111111111111111111111111111"),
            ("X402_MAX_AMOUNT", "42"),
            ("X402_FACILITATOR_URL", "http://localhost:4020"),
            ("X402_SIGNER_PRIVATE_KEY", "deadbeef"),
        ]));
        let requirement = manager.payment_requirement().unwrap();
        assert_eq!(requirement.max_amount_required, U256::from(42));
        assert_eq!(
            crate::types::address_hex(&requirement.pay_to),
            "0x1111111111111111111111111111111111111111"
        );
        match manager.settlement() {
            SettlementConfig::Facilitator { url, .. } => assert_eq!(url, "http://localhost:4020"),
            other => panic!("unexpected settlement config {:?}", other),
        }
        let key = manager.signer_key().unwrap();
        assert_eq!(key.expose(), "deadbeef");
        assert_eq!(format!("{:?}", key), "SecretKey(***)");
    }

    #[test]
    fn test_config_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gate.json");
        let config = ConfigBuilder::new()
            .with_direct_settlement("http://127.0.0.1:8545")
            .with_verification(VerificationMode::Facilitator)
            .build();
        std::fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();

        let manager = ConfigManager::from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(manager.get_config().verification, VerificationMode::Facilitator);
        assert!(matches!(
            manager.get_config().settlement,
            SettlementConfig::Direct { confirmations: 1, .. }
        ));
        assert_eq!(manager.get_config().settlement.timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            ConfigManager::from_file("/nonexistent/gate.json"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_default_policy_from_environment() {
        let manager = ConfigManager::from_config(ConfigBuilder::new().build()).with_environment(env(&[
            ("X402_ELIGIBILITY_GATE_ENABLED", "true"),
            ("X402_PER_IDENTITY_LIMIT", "3"),
        ]));
        let policy = manager.default_policy();
        assert!(policy.eligibility_gate_enabled);
        assert_eq!(policy.per_identity_limit, Some(3));
    }
}
