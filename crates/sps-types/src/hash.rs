//! Determinism hash used to compare replica responses.

use std::fmt::{self, Debug, Display};

use serde::{Deserialize, Serialize};

/// Length of the determinism digest in bytes.
pub const RESULT_HASH_LENGTH: usize = 32;

/// Opaque per-result digest. The execution engine computes this over a
/// response's logical contents; the scheduler never interprets the bytes,
/// only compares them for equality across replicas.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResultHash([u8; RESULT_HASH_LENGTH]);

impl ResultHash {
    pub fn from_bytes(bytes: [u8; RESULT_HASH_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; RESULT_HASH_LENGTH] {
        &self.0
    }
}

impl Debug for ResultHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ResultHash({:02x}{:02x}{:02x}{:02x}...)",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

impl Display for ResultHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl From<[u8; RESULT_HASH_LENGTH]> for ResultHash {
    fn from(bytes: [u8; RESULT_HASH_LENGTH]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for ResultHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_bytes_compare_equal() {
        let a = ResultHash::from_bytes([7u8; RESULT_HASH_LENGTH]);
        let b = ResultHash::from_bytes([7u8; RESULT_HASH_LENGTH]);
        assert_eq!(a, b);
    }

    #[test]
    fn different_bytes_compare_unequal() {
        let a = ResultHash::from_bytes([1u8; RESULT_HASH_LENGTH]);
        let mut bytes = [1u8; RESULT_HASH_LENGTH];
        bytes[0] = 2;
        let b = ResultHash::from_bytes(bytes);
        assert_ne!(a, b);
    }
}
