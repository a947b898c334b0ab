use std::{fmt, str::FromStr};

use num_bigint::BigUint;
use num_traits::{Num, Zero};
use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};

/// Name under which the storage contract is recorded on the ledger.
pub const SIMPLE_STORAGE: &str = "SimpleStorage";

/// Width of the storage slot, in bits.
pub const VALUE_BITS: u64 = 256;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ValueError {
    #[error("value does not fit in 256 bits")]
    OutOfRange,
    #[error("invalid unsigned integer {0:?}")]
    Malformed(String),
}

/// Parses a decimal or `0x`-prefixed hexadecimal unsigned integer.
///
/// No range check happens here; that is the job of [`StoredValue::new`].
pub fn parse_integer(input: &str) -> Result<BigUint, ValueError> {
    let s = input.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(digits) => BigUint::from_str_radix(digits, 16),
        None => BigUint::from_str_radix(s, 10),
    };
    parsed.map_err(|_| ValueError::Malformed(input.to_string()))
}

/// The integer held by a [`SimpleStorage`] instance.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StoredValue(BigUint);

impl StoredValue {
    pub fn new(value: BigUint) -> Result<Self, ValueError> {
        if value.bits() > VALUE_BITS {
            return Err(ValueError::OutOfRange);
        }
        Ok(Self(value))
    }

    pub fn zero() -> Self {
        Self(BigUint::zero())
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn as_biguint(&self) -> &BigUint {
        &self.0
    }

    /// Big-endian bytes, empty for zero. Used when hashing state.
    pub fn to_bytes_be(&self) -> Vec<u8> {
        if self.0.is_zero() {
            Vec::new()
        } else {
            self.0.to_bytes_be()
        }
    }
}

impl From<u64> for StoredValue {
    fn from(value: u64) -> Self {
        Self(BigUint::from(value))
    }
}

impl TryFrom<BigUint> for StoredValue {
    type Error = ValueError;

    fn try_from(value: BigUint) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl FromStr for StoredValue {
    type Err = ValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(parse_integer(s)?)
    }
}

impl fmt::Display for StoredValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// Decimal strings keep 256-bit values readable in JSON snapshots.
impl Serialize for StoredValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for StoredValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        encoded.parse().map_err(D::Error::custom)
    }
}

/// State-changing calls accepted by [`SimpleStorage`].
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageCall {
    Store { value: StoredValue },
}

impl StorageCall {
    /// Canonical bytes of the call, fed into transaction digests.
    pub fn commitment(&self) -> Vec<u8> {
        match self {
            StorageCall::Store { value } => {
                let bytes = value.to_bytes_be();
                let mut buf = Vec::with_capacity(5 + 8 + bytes.len());
                buf.extend_from_slice(b"store");
                buf.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
                buf.extend_from_slice(&bytes);
                buf
            }
        }
    }
}

/// One stored integer, zero until the first store.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SimpleStorage {
    value: StoredValue,
}

impl SimpleStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn execute(&mut self, call: &StorageCall) {
        match call {
            StorageCall::Store { value } => self.value = value.clone(),
        }
    }

    pub fn retrieve(&self) -> &StoredValue {
        &self.value
    }
}
