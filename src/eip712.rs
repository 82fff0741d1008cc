//! EIP-712 typed-data hashing for the CTF exchange `Order` struct.
//!
//! The exchange verifies signatures over `keccak256(0x1901 || domainSeparator
//! || structHash)` where the domain is pinned to the exchange contract and the
//! struct layout matches the on-chain order type.

use alloy::primitives::{keccak256, Address, B256, U256};

pub const DOMAIN_NAME: &str = "Polymarket CTF Exchange";
pub const DOMAIN_VERSION: &str = "1";

const EIP712_DOMAIN_TYPE: &[u8] =
    b"EIP712Domain(string name,string version,uint256 chainId,address verifyingContract)";

const ORDER_TYPE: &[u8] = b"Order(uint256 salt,address maker,address signer,address taker,uint256 tokenId,uint256 makerAmount,uint256 takerAmount,uint256 expiration,uint256 nonce,uint256 feeRateBps,uint8 side,uint8 signatureType)";

/// ABI values of one order, in struct-type field order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderFields {
    pub salt: U256,
    pub maker: Address,
    pub signer: Address,
    pub taker: Address,
    pub token_id: U256,
    pub maker_amount: U256,
    pub taker_amount: U256,
    pub expiration: U256,
    pub nonce: U256,
    pub fee_rate_bps: U256,
    pub side: u8,
    pub signature_type: u8,
}

/// Hash of the EIP-712 domain binding signatures to one exchange deployment.
pub fn domain_separator(chain_id: u64, verifying_contract: Address) -> B256 {
    let mut encoded = Vec::with_capacity(5 * 32);
    encoded.extend_from_slice(keccak256(EIP712_DOMAIN_TYPE).as_slice());
    encoded.extend_from_slice(keccak256(DOMAIN_NAME.as_bytes()).as_slice());
    encoded.extend_from_slice(keccak256(DOMAIN_VERSION.as_bytes()).as_slice());
    encoded.extend_from_slice(&U256::from(chain_id).to_be_bytes::<32>());
    encoded.extend_from_slice(&encode_address(verifying_contract));
    keccak256(&encoded)
}

/// `keccak256(typeHash || abi.encode(fields))` per EIP-712 `hashStruct`.
pub fn struct_hash(fields: &OrderFields) -> B256 {
    let mut encoded = Vec::with_capacity(13 * 32);
    encoded.extend_from_slice(keccak256(ORDER_TYPE).as_slice());
    encoded.extend_from_slice(&fields.salt.to_be_bytes::<32>());
    encoded.extend_from_slice(&encode_address(fields.maker));
    encoded.extend_from_slice(&encode_address(fields.signer));
    encoded.extend_from_slice(&encode_address(fields.taker));
    encoded.extend_from_slice(&fields.token_id.to_be_bytes::<32>());
    encoded.extend_from_slice(&fields.maker_amount.to_be_bytes::<32>());
    encoded.extend_from_slice(&fields.taker_amount.to_be_bytes::<32>());
    encoded.extend_from_slice(&fields.expiration.to_be_bytes::<32>());
    encoded.extend_from_slice(&fields.nonce.to_be_bytes::<32>());
    encoded.extend_from_slice(&fields.fee_rate_bps.to_be_bytes::<32>());
    encoded.extend_from_slice(&encode_u8(fields.side));
    encoded.extend_from_slice(&encode_u8(fields.signature_type));
    keccak256(&encoded)
}

/// Final digest handed to ECDSA: `keccak256(0x1901 || domain || struct)`.
pub fn signing_digest(domain: B256, struct_hash: B256) -> B256 {
    let mut message = Vec::with_capacity(2 + 64);
    message.extend_from_slice(&[0x19, 0x01]);
    message.extend_from_slice(domain.as_slice());
    message.extend_from_slice(struct_hash.as_slice());
    keccak256(&message)
}

fn encode_address(address: Address) -> [u8; 32] {
    let mut buf = [0u8; 32];
    buf[12..].copy_from_slice(address.as_slice());
    buf
}

fn encode_u8(value: u8) -> [u8; 32] {
    let mut buf = [0u8; 32];
    buf[31] = value;
    buf
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    fn sample_fields() -> OrderFields {
        let maker = Address::from_str("0x7E5F4552091A69125d5DfCb7b8C2659029395Bdf").unwrap();
        OrderFields {
            salt: U256::ZERO,
            maker,
            signer: maker,
            taker: Address::ZERO,
            token_id: U256::from(1234567890u64),
            maker_amount: U256::from(1_000_000u64),
            taker_amount: U256::from(2_000_000u64),
            expiration: U256::ZERO,
            nonce: U256::ZERO,
            fee_rate_bps: U256::ZERO,
            side: 0,
            signature_type: 0,
        }
    }

    #[test]
    fn domain_type_hash_is_canonical() {
        // Well-known EIP-712 domain type hash.
        assert_eq!(
            keccak256(EIP712_DOMAIN_TYPE).to_string(),
            "0x8b73c3c69bb8fe3d512ecc4cf759cc79239f7b179b0ffacaa9a75d522b39400f"
        );
    }

    #[test]
    fn domain_separator_depends_on_chain_and_contract() {
        let exchange = Address::from_str("0x4bFb41d5B3570DeFd03C39a9A4D8dE6Bd8B8982E").unwrap();
        let mainnet = domain_separator(137, exchange);
        assert_eq!(mainnet, domain_separator(137, exchange));
        assert_ne!(mainnet, domain_separator(80002, exchange));
        assert_ne!(mainnet, domain_separator(137, Address::ZERO));
    }

    #[test]
    fn struct_hash_is_field_sensitive() {
        let fields = sample_fields();
        let base = struct_hash(&fields);
        assert_eq!(base, struct_hash(&fields));

        let mut flipped = fields.clone();
        flipped.side = 1;
        assert_ne!(base, struct_hash(&flipped));

        let mut salted = fields;
        salted.salt = U256::from(1u64);
        assert_ne!(base, struct_hash(&salted));
    }

    #[test]
    fn digest_prefixes_1901() {
        let exchange = Address::from_str("0x4bFb41d5B3570DeFd03C39a9A4D8dE6Bd8B8982E").unwrap();
        let domain = domain_separator(137, exchange);
        let hash = struct_hash(&sample_fields());

        let mut manual = vec![0x19, 0x01];
        manual.extend_from_slice(domain.as_slice());
        manual.extend_from_slice(hash.as_slice());
        assert_eq!(signing_digest(domain, hash), keccak256(&manual));
    }

    #[test]
    fn address_encoding_left_pads() {
        let address = Address::from_str("0x4bFb41d5B3570DeFd03C39a9A4D8dE6Bd8B8982E").unwrap();
        let encoded = encode_address(address);
        assert!(encoded[..12].iter().all(|byte| *byte == 0));
        assert_eq!(&encoded[12..], address.as_slice());

        let encoded = encode_u8(2);
        assert_eq!(encoded[31], 2);
        assert!(encoded[..31].iter().all(|byte| *byte == 0));
    }
}
