//! Identity key ids and their colon-separated hex form.
//!
//! The same 256-bit id addresses the key pair and the certificate in the
//! keystore, and doubles as the certificate serial number. Its textual form
//! (`A1:B2:03`) is used both for display and as command input.

use std::fmt;
use std::str::FromStr;

use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{Error, Result};

/// Length of a freshly generated key id in bytes.
pub const KEY_ID_LEN: usize = 32;

/// Binary identifier shared by a key pair and its certificate.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyId(Vec<u8>);

impl KeyId {
    /// Wrap raw id bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Draw a fresh random id from the operating system's secure source.
    pub fn generate() -> Result<Self> {
        let mut bytes = [0u8; KEY_ID_LEN];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| Error::Randomness(e.to_string()))?;
        Ok(Self(bytes.to_vec()))
    }

    /// Parse a serial number such as `A1:B2:03`.
    ///
    /// Hex digits are case-insensitive and colons are optional.
    pub fn parse(serial: &str) -> Result<Self> {
        let bytes = hex_decode(serial)?;
        if bytes.is_empty() {
            return Err(Error::MalformedSerial("serial number is empty".to_string()));
        }
        Ok(Self(bytes))
    }

    /// Get the raw id bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Render as the colon-separated uppercase serial form.
    pub fn to_serial(&self) -> String {
        hex_encode(&self.0)
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_serial())
    }
}

impl FromStr for KeyId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl From<Vec<u8>> for KeyId {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

/// Encode bytes as two-digit uppercase hex octets joined by `:`.
pub fn hex_encode(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Decode colon-separated hex back into bytes.
pub fn hex_decode(serial: &str) -> Result<Vec<u8>> {
    let stripped: String = serial.trim().chars().filter(|c| *c != ':').collect();
    hex::decode(&stripped).map_err(|e| Error::MalformedSerial(format!("'{}': {}", serial, e)))
}
