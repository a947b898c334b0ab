use std::{fmt, str::FromStr};

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::contracts::StorageCall;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdParseError {
    #[error("invalid hex: {0}")]
    Hex(String),
    #[error("expected {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },
}

fn decode_fixed<const N: usize>(input: &str) -> Result<[u8; N], IdParseError> {
    let s = input.trim();
    let s = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    let bytes = hex::decode(s).map_err(|e| IdParseError::Hex(e.to_string()))?;
    if bytes.len() != N {
        return Err(IdParseError::Length {
            expected: N,
            actual: bytes.len(),
        });
    }
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// Fixed-size byte identifiers shown as hex, also when used as JSON map keys.
macro_rules! hex_id {
    ($(#[$meta:meta])* $name:ident, $len:expr, $prefix:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub [u8; $len]);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}{}", $prefix, hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }

        impl FromStr for $name {
            type Err = IdParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                decode_fixed::<$len>(s).map(Self)
            }
        }

        impl Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let encoded = String::deserialize(deserializer)?;
                encoded.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

hex_id!(
    /// 20-byte account or contract address.
    Address,
    20,
    "0x"
);
hex_id!(
    /// SHA-256 digest identifying a transaction or a block.
    Hash32,
    32,
    "0x"
);
hex_id!(
    /// Raw ed25519 verifying key.
    PublicKey,
    32,
    ""
);

pub type TxHash = Hash32;
pub type BlockHash = Hash32;

impl Address {
    pub fn from_public_key(key: &PublicKey) -> Self {
        let digest = Sha256::digest(key.0);
        let mut out = [0u8; 20];
        out.copy_from_slice(&digest[12..]);
        Self(out)
    }

    /// Address of the contract created by `deployer` with the given nonce.
    pub fn for_contract(deployer: &Address, nonce: u64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"contract");
        hasher.update(deployer.0);
        hasher.update(nonce.to_le_bytes());
        let digest = hasher.finalize();
        let mut out = [0u8; 20];
        out.copy_from_slice(&digest[..20]);
        Self(out)
    }
}

impl From<&VerifyingKey> for PublicKey {
    fn from(key: &VerifyingKey) -> Self {
        Self(key.to_bytes())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("invalid secret key hex: {0}")]
    Hex(String),
    #[error("secret key must be 32 bytes (64 hex chars), got {0} bytes")]
    Length(usize),
}

pub fn parse_signing_key(sk_hex: &str) -> Result<SigningKey, KeyError> {
    let sk_bytes = hex::decode(sk_hex.trim()).map_err(|e| KeyError::Hex(e.to_string()))?;
    if sk_bytes.len() != 32 {
        return Err(KeyError::Length(sk_bytes.len()));
    }
    let mut arr = [0u8; 32];
    arr.copy_from_slice(&sk_bytes);
    Ok(SigningKey::from_bytes(&arr))
}

pub fn generate_signing_key() -> SigningKey {
    let mut sk_bytes = [0u8; 32];
    OsRng.fill_bytes(&mut sk_bytes);
    SigningKey::from_bytes(&sk_bytes)
}

pub fn signer_address(key: &SigningKey) -> Address {
    Address::from_public_key(&PublicKey::from(&key.verifying_key()))
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TxAction {
    Deploy,
    Call { to: Address, call: StorageCall },
}

impl TxAction {
    pub fn commitment(&self) -> Vec<u8> {
        match self {
            TxAction::Deploy => b"deploy".to_vec(),
            TxAction::Call { to, call } => {
                let mut buf = Vec::new();
                buf.extend_from_slice(b"call");
                buf.extend_from_slice(&to.0);
                buf.extend(call.commitment());
                buf
            }
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transaction {
    pub sender: PublicKey,
    pub nonce: u64,
    pub action: TxAction,
}

impl Transaction {
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(b"simple-storage/tx");
        hasher.update(self.sender.0);
        hasher.update(self.nonce.to_le_bytes());
        hasher.update(self.action.commitment());
        hasher.finalize().into()
    }

    pub fn sender_address(&self) -> Address {
        Address::from_public_key(&self.sender)
    }

    pub fn sign(self, key: &SigningKey) -> SignedTransaction {
        let signature = key.sign(&self.digest());
        SignedTransaction {
            tx: self,
            signature: signature.to_bytes().to_vec(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignedTransaction {
    pub tx: Transaction,
    #[serde(with = "crate::tx::serde_bytes")]
    pub signature: Vec<u8>,
}

impl SignedTransaction {
    pub fn hash(&self) -> TxHash {
        let mut hasher = Sha256::new();
        hasher.update(self.tx.digest());
        hasher.update(&self.signature);
        Hash32(hasher.finalize().into())
    }

    pub fn verify(&self) -> Result<(), SignatureError> {
        let key = VerifyingKey::from_bytes(&self.tx.sender.0)
            .map_err(|_| SignatureError::MalformedKey(self.tx.sender))?;
        let signature =
            Signature::from_slice(&self.signature).map_err(|_| SignatureError::MalformedSignature)?;
        key.verify_strict(&self.tx.digest(), &signature)
            .map_err(|_| SignatureError::InvalidSignature(self.tx.sender_address()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("malformed public key {0}")]
    MalformedKey(PublicKey),
    #[error("malformed signature")]
    MalformedSignature,
    #[error("invalid signature from {0}")]
    InvalidSignature(Address),
}

pub(crate) mod serde_bytes {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        hex::decode(&encoded).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::StoredValue;

    fn store_tx(key: &SigningKey, nonce: u64, value: u64) -> Transaction {
        Transaction {
            sender: PublicKey::from(&key.verifying_key()),
            nonce,
            action: TxAction::Call {
                to: Address([7u8; 20]),
                call: StorageCall::Store {
                    value: StoredValue::from(value),
                },
            },
        }
    }

    #[test]
    fn signed_transaction_verifies() {
        let key = generate_signing_key();
        let signed = store_tx(&key, 0, 50).sign(&key);
        signed.verify().unwrap();
    }

    #[test]
    fn tampered_transaction_is_rejected() {
        let key = generate_signing_key();
        let mut signed = store_tx(&key, 0, 50).sign(&key);
        signed.tx.action = store_tx(&key, 0, 51).action;
        assert_eq!(
            signed.verify().unwrap_err(),
            SignatureError::InvalidSignature(signer_address(&key))
        );

        let mut truncated = store_tx(&key, 0, 50).sign(&key);
        truncated.signature.pop();
        assert_eq!(
            truncated.verify().unwrap_err(),
            SignatureError::MalformedSignature
        );
    }

    #[test]
    fn hash_depends_on_nonce() {
        let key = generate_signing_key();
        let a = store_tx(&key, 0, 50).sign(&key);
        let b = store_tx(&key, 1, 50).sign(&key);
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn contract_addresses_differ_per_nonce() {
        let deployer = Address([1u8; 20]);
        assert_ne!(
            Address::for_contract(&deployer, 0),
            Address::for_contract(&deployer, 1)
        );
    }

    #[test]
    fn address_parses_with_or_without_prefix() {
        let address = Address([0xab; 20]);
        let shown = address.to_string();
        assert!(shown.starts_with("0x"));
        assert_eq!(shown.parse::<Address>().unwrap(), address);
        assert_eq!(shown[2..].parse::<Address>().unwrap(), address);
        assert_eq!(
            "0x1234".parse::<Address>().unwrap_err(),
            IdParseError::Length {
                expected: 20,
                actual: 2
            }
        );
    }

    #[test]
    fn signing_key_hex_is_validated() {
        let key = generate_signing_key();
        let parsed = parse_signing_key(&hex::encode(key.to_bytes())).unwrap();
        assert_eq!(parsed.to_bytes(), key.to_bytes());
        assert_eq!(parse_signing_key("abcd").unwrap_err(), KeyError::Length(2));
        assert!(matches!(parse_signing_key("zz"), Err(KeyError::Hex(_))));
    }
}
