//! Order construction and EIP-712 signing for the CTF exchange.

use std::str::FromStr;

use alloy::primitives::{hex, Address, U256};
use alloy_signer::SignerSync;
use alloy_signer_local::PrivateKeySigner;
use rand::RngCore;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Serialize, Serializer};

use crate::{
    eip712::{domain_separator, signing_digest, struct_hash, OrderFields},
    errors::SignerError,
};

/// Maker side of the exchange order struct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_u8(self) -> u8 {
        match self {
            OrderSide::Buy => 0,
            OrderSide::Sell => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

/// Signature variants accepted by the exchange contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureType {
    /// Direct externally-owned-account signature.
    Eoa = 0,
    /// Polymarket proxy wallet.
    PolyProxy = 1,
    /// Polymarket Gnosis Safe wallet.
    PolyGnosisSafe = 2,
}

impl SignatureType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl Serialize for SignatureType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.as_u8())
    }
}

/// Canonical pre-sign order payload. All numeric fields are decimal strings,
/// matching the wire format the exchange expects.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderData {
    pub maker: String,
    pub taker: String,
    pub token_id: String,
    pub maker_amount: String,
    pub taker_amount: String,
    pub side: OrderSide,
    pub fee_rate_bps: String,
    pub nonce: String,
    pub expiration: String,
    pub signer: String,
    pub signature_type: SignatureType,
    pub salt: String,
}

impl OrderData {
    /// Buy order skeleton with zeroed fee/nonce/expiration and empty salt.
    pub fn new(token_id: impl Into<String>, side: OrderSide) -> Self {
        Self {
            maker: String::new(),
            taker: Address::ZERO.to_checksum(None),
            token_id: token_id.into(),
            maker_amount: "0".to_string(),
            taker_amount: "0".to_string(),
            side,
            fee_rate_bps: "0".to_string(),
            nonce: "0".to_string(),
            expiration: "0".to_string(),
            signer: String::new(),
            signature_type: SignatureType::Eoa,
            salt: String::new(),
        }
    }
}

/// An order plus its 65-byte `r || s || v` signature, hex encoded.
#[derive(Debug, Clone, Serialize)]
pub struct SignedOrder {
    #[serde(flatten)]
    pub order: OrderData,
    pub signature: String,
}

/// Signs exchange orders with a secp256k1 key bound to one chain id.
pub struct OrderSigner {
    signer: PrivateKeySigner,
    chain_id: u64,
    address: String,
}

impl OrderSigner {
    /// Derives the EIP-55 checksummed address from `private_key_hex`
    /// (`0x` prefix optional).
    pub fn new(private_key_hex: &str, chain_id: u64) -> Result<Self, SignerError> {
        let key = private_key_hex
            .strip_prefix("0x")
            .unwrap_or(private_key_hex);
        let signer = PrivateKeySigner::from_str(key)
            .map_err(|err| SignerError::InvalidKey(err.to_string()))?;
        let address = signer.address().to_checksum(None);
        Ok(Self {
            signer,
            chain_id,
            address,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Canonicalises `order` (salt and signer defaults), hashes it under the
    /// exchange domain, and signs the digest.
    ///
    /// An order whose `signer` differs from the key's address is rejected for
    /// the EOA signature type; proxy wallet types delegate that check to the
    /// contract.
    pub fn sign_order(
        &self,
        mut order: OrderData,
        exchange_address: &str,
    ) -> Result<SignedOrder, SignerError> {
        if order.salt.is_empty() {
            order.salt = generate_salt();
        }
        if order.signer.is_empty() {
            order.signer = self.address.clone();
        }
        if order.signature_type == SignatureType::Eoa
            && !order.signer.eq_ignore_ascii_case(&self.address)
        {
            return Err(SignerError::SignerMismatch {
                signer: order.signer,
                address: self.address.clone(),
            });
        }

        let exchange = parse_address("exchange_address", exchange_address)?;
        let taker = if order.taker.is_empty() {
            Address::ZERO
        } else {
            parse_address("taker", &order.taker)?
        };
        let fields = OrderFields {
            salt: parse_u256("salt", &order.salt)?,
            maker: parse_address("maker", &order.maker)?,
            signer: parse_address("signer", &order.signer)?,
            taker,
            token_id: parse_u256("token_id", &order.token_id)?,
            maker_amount: parse_u256("maker_amount", &order.maker_amount)?,
            taker_amount: parse_u256("taker_amount", &order.taker_amount)?,
            expiration: parse_u256("expiration", &order.expiration)?,
            nonce: parse_u256("nonce", &order.nonce)?,
            fee_rate_bps: parse_u256("fee_rate_bps", &order.fee_rate_bps)?,
            side: order.side.as_u8(),
            signature_type: order.signature_type.as_u8(),
        };

        let domain = domain_separator(self.chain_id, exchange);
        let digest = signing_digest(domain, struct_hash(&fields));
        let signature = self
            .signer
            .sign_hash_sync(&digest)
            .map_err(|err| SignerError::Signing(err.to_string()))?;

        let mut bytes = [0u8; 65];
        bytes[..32].copy_from_slice(&signature.r().to_be_bytes::<32>());
        bytes[32..64].copy_from_slice(&signature.s().to_be_bytes::<32>());
        bytes[64] = if signature.v() { 28 } else { 27 };

        Ok(SignedOrder {
            order,
            signature: format!("0x{}", hex::encode(bytes)),
        })
    }
}

/// Scales a decimal amount into an integer string with `decimals` places,
/// using banker's rounding when the value carries more fractional digits.
pub fn to_wei(value: Decimal, decimals: u8) -> Result<String, SignerError> {
    if decimals > 28 {
        return Err(SignerError::InvalidAmount {
            field: "decimals",
            value: decimals.to_string(),
        });
    }
    if value.is_sign_negative() {
        return Err(SignerError::InvalidAmount {
            field: "value",
            value: value.to_string(),
        });
    }
    let scale = Decimal::from_i128_with_scale(10i128.pow(u32::from(decimals)), 0);
    let scaled = value.checked_mul(scale).ok_or(SignerError::InvalidAmount {
        field: "value",
        value: value.to_string(),
    })?;
    let rounded = scaled.round_dp_with_strategy(0, RoundingStrategy::MidpointNearestEven);
    Ok(rounded.normalize().to_string())
}

/// 256-bit cryptographically random salt rendered as a decimal string.
pub fn generate_salt() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    U256::from_be_bytes(bytes).to_string()
}

fn parse_address(field: &'static str, value: &str) -> Result<Address, SignerError> {
    Address::from_str(value)
        .map_err(|_| SignerError::InvalidAddress(format!("{field}: {value:?}")))
}

fn parse_u256(field: &'static str, value: &str) -> Result<U256, SignerError> {
    U256::from_str(value).map_err(|_| SignerError::InvalidAmount {
        field,
        value: value.to_string(),
    })
}
