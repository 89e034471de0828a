/// EIP-712 hashing and signer recovery for EIP-3009 `TransferWithAuthorization`.
use crate::types::PaymentRequirement;
use ethers::abi::{Token, encode};
use ethers::signers::LocalWallet;
use ethers::types::{Address, H256, RecoveryMessage, Signature, U256};
use ethers::utils::keccak256;
use std::str::FromStr;

const EIP712_DOMAIN_TYPE: &str =
    "EIP712Domain(string name,string version,uint256 chainId,address verifyingContract)";

const TRANSFER_WITH_AUTHORIZATION_TYPE: &str = "TransferWithAuthorization(address from,address to,uint256 value,uint256 validAfter,uint256 validBefore,bytes32 nonce)";

/// Authorization fields in their on-chain types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypedAuthorization {
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub valid_after: U256,
    pub valid_before: U256,
    pub nonce: [u8; 32],
}

/// A 65-byte signature split the way `transferWithAuthorization(.., v, r, s)` wants it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignatureParts {
    pub v: u8,
    pub r: [u8; 32],
    pub s: [u8; 32],
}

/// Signing domain of the asset contract named by the requirement.
pub fn domain_separator(requirement: &PaymentRequirement) -> [u8; 32] {
    keccak256(encode(&[
        Token::FixedBytes(keccak256(EIP712_DOMAIN_TYPE).to_vec()),
        Token::FixedBytes(keccak256(requirement.extra.name.as_bytes()).to_vec()),
        Token::FixedBytes(keccak256(requirement.extra.version.as_bytes()).to_vec()),
        Token::Uint(U256::from(requirement.network.chain_id())),
        Token::Address(requirement.asset),
    ]))
}

pub fn struct_hash(authorization: &TypedAuthorization) -> [u8; 32] {
    keccak256(encode(&[
        Token::FixedBytes(keccak256(TRANSFER_WITH_AUTHORIZATION_TYPE).to_vec()),
        Token::Address(authorization.from),
        Token::Address(authorization.to),
        Token::Uint(authorization.value),
        Token::Uint(authorization.valid_after),
        Token::Uint(authorization.valid_before),
        Token::FixedBytes(authorization.nonce.to_vec()),
    ]))
}

/// The digest the payer signed: `keccak256(0x1901 ‖ domainSeparator ‖ structHash)`.
pub fn signing_digest(requirement: &PaymentRequirement, authorization: &TypedAuthorization) -> H256 {
    let mut preimage = Vec::with_capacity(66);
    preimage.extend_from_slice(&[0x19, 0x01]);
    preimage.extend_from_slice(&domain_separator(requirement));
    preimage.extend_from_slice(&struct_hash(authorization));
    H256::from(keccak256(preimage))
}

/// Recover the address that produced `signature` over the authorization.
pub fn recover_signer(
    requirement: &PaymentRequirement,
    authorization: &TypedAuthorization,
    signature: &str,
) -> Result<Address, String> {
    let signature = parse_signature(signature)?;
    let digest = signing_digest(requirement, authorization);
    signature
        .recover(RecoveryMessage::Hash(digest))
        .map_err(|e| e.to_string())
}

pub fn parse_signature(signature: &str) -> Result<Signature, String> {
    let bytes = decode_hex(signature)?;
    if bytes.len() != 65 {
        return Err(format!("expected 65 signature bytes, got {}", bytes.len()));
    }
    Signature::try_from(bytes.as_slice()).map_err(|e| e.to_string())
}

/// Decode a signature into its canonical `(v, r, s)` components.
pub fn split_signature(signature: &str) -> Result<SignatureParts, String> {
    let signature = parse_signature(signature)?;
    let v = match signature.v {
        0 | 1 => signature.v as u8 + 27,
        27 | 28 => signature.v as u8,
        other => return Err(format!("unsupported recovery id {}", other)),
    };
    let mut r = [0u8; 32];
    let mut s = [0u8; 32];
    signature.r.to_big_endian(&mut r);
    signature.s.to_big_endian(&mut s);
    Ok(SignatureParts { v, r, s })
}

pub fn parse_address(address: &str) -> Result<Address, String> {
    let trimmed = address.trim();
    let digits = trimmed.strip_prefix("0X").unwrap_or(trimmed);
    Address::from_str(digits).map_err(|_| format!("invalid address {:?}", address))
}

pub fn parse_nonce(nonce: &str) -> Result<[u8; 32], String> {
    let bytes = decode_hex(nonce)?;
    <[u8; 32]>::try_from(bytes.as_slice())
        .map_err(|_| format!("nonce must be 32 bytes, got {}", bytes.len()))
}

fn decode_hex(value: &str) -> Result<Vec<u8>, String> {
    let value = value.trim();
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    hex::decode(digits).map_err(|e| format!("invalid hex: {}", e))
}

/// A fresh random EIP-3009 nonce, `0x`-prefixed.
pub fn random_nonce() -> String {
    let nonce: [u8; 32] = rand::random();
    format!("0x{}", hex::encode(nonce))
}

/// Payer-side helper: sign an authorization for `requirement` and return the
/// `0x`-prefixed 65-byte signature.
pub fn sign_authorization(
    wallet: &LocalWallet,
    requirement: &PaymentRequirement,
    authorization: &TypedAuthorization,
) -> Result<String, String> {
    let digest = signing_digest(requirement, authorization);
    let signature = wallet.sign_hash(digest).map_err(|e| e.to_string())?;
    Ok(format!("0x{}", hex::encode(signature.to_vec())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EvmNetwork;
    use ethers::signers::Signer;

    const TEST_KEY: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    fn requirement() -> PaymentRequirement {
        PaymentRequirement::exact(
            EvmNetwork::custom("chain-A", 31337),
            Address::repeat_byte(0x11),
            Address::repeat_byte(0x22),
            U256::from(100_000u64),
            "/mint",
        )
    }

    fn authorization(from: Address) -> TypedAuthorization {
        TypedAuthorization {
            from,
            to: Address::repeat_byte(0x22),
            value: U256::from(100_000u64),
            valid_after: U256::zero(),
            valid_before: U256::from(u64::MAX),
            nonce: [7u8; 32],
        }
    }

    #[test]
    fn test_recover_matches_signer() {
        let wallet: LocalWallet = TEST_KEY.parse().unwrap();
        let auth = authorization(wallet.address());
        let signature = sign_authorization(&wallet, &requirement(), &auth).unwrap();
        let recovered = recover_signer(&requirement(), &auth, &signature).unwrap();
        assert_eq!(recovered, wallet.address());
    }

    #[test]
    fn test_domain_binds_chain_and_contract() {
        let base = requirement();
        let mut other_chain = requirement();
        other_chain.network = EvmNetwork::custom("chain-A", 1);
        let mut other_asset = requirement();
        other_asset.asset = Address::repeat_byte(0x33);
        assert_ne!(domain_separator(&base), domain_separator(&other_chain));
        assert_ne!(domain_separator(&base), domain_separator(&other_asset));
    }

    #[test]
    fn test_tampered_value_recovers_someone_else() {
        let wallet: LocalWallet = TEST_KEY.parse().unwrap();
        let auth = authorization(wallet.address());
        let signature = sign_authorization(&wallet, &requirement(), &auth).unwrap();
        let mut tampered = auth.clone();
        tampered.value = U256::from(1u64);
        let recovered = recover_signer(&requirement(), &tampered, &signature);
        assert_ne!(recovered.ok(), Some(wallet.address()));
    }

    #[test]
    fn test_split_signature() {
        let wallet: LocalWallet = TEST_KEY.parse().unwrap();
        let auth = authorization(wallet.address());
        let signature = sign_authorization(&wallet, &requirement(), &auth).unwrap();
        let parts = split_signature(&signature).unwrap();
        assert!(parts.v == 27 || parts.v == 28);

        let raw = hex::decode(signature.trim_start_matches("0x")).unwrap();
        assert_eq!(&parts.r[..], &raw[..32]);
        assert_eq!(&parts.s[..], &raw[32..64]);
    }

    #[test]
    fn test_parse_nonce_and_signature_lengths() {
        assert!(parse_nonce(&random_nonce()).is_ok());
        assert!(parse_nonce("0x1234").is_err());
        assert!(parse_signature("0xdeadbeef").is_err());
        assert!(parse_signature("not hex").is_err());
    }

    #[test]
    fn test_address_spellings() {
        let expected = Address::repeat_byte(0x4d);
        let digits = "4d".repeat(20);
        for spelling in [
            format!("0x{}", digits),
            digits.to_uppercase(),
            format!("0X{}", digits.to_uppercase()),
        ] {
            assert_eq!(parse_address(&spelling).unwrap(), expected);
        }
        assert!(parse_address("0x4d").is_err());
    }
}
