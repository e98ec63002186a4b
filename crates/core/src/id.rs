//! Strongly-typed job identifier.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Identifier of a job, assigned by the repository at creation.
///
/// On the wire (broker messages) a job id is its decimal representation,
/// e.g. `"42"`. Only positive values are valid.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(i64);

impl JobId {
    /// Wrap a raw identifier, rejecting non-positive values.
    pub fn new(raw: i64) -> Result<Self, DomainError> {
        if raw <= 0 {
            return Err(DomainError::invalid_id(format!("JobId must be positive, got {raw}")));
        }
        Ok(Self(raw))
    }

    pub fn get(&self) -> i64 {
        self.0
    }

    /// Lock-store key guarding exclusive processing of this job.
    pub fn lock_key(&self) -> String {
        format!("job:lock:{}", self.0)
    }

    /// Decode a broker payload (decimal string bytes).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DomainError> {
        let s = core::str::from_utf8(bytes)
            .map_err(|e| DomainError::invalid_id(format!("JobId: payload is not utf-8: {e}")))?;
        s.parse()
    }

    /// Encode as a broker payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.to_string().into_bytes()
    }
}

impl core::fmt::Display for JobId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<JobId> for i64 {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl TryFrom<i64> for JobId {
    type Error = DomainError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl FromStr for JobId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Strict decimal: no sign, no whitespace.
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(DomainError::invalid_id(format!("JobId: not a decimal id: {s:?}")));
        }
        let raw = s
            .parse::<i64>()
            .map_err(|e| DomainError::invalid_id(format!("JobId: {e}")))?;
        Self::new(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parses_decimal_ids() {
        assert_eq!("42".parse::<JobId>().unwrap().get(), 42);
        assert_eq!(JobId::from_bytes(b"7").unwrap().get(), 7);
    }

    #[test]
    fn rejects_malformed_payloads() {
        for bad in ["", "abc", "-3", "0", " 4", "4 ", "1.5", "99999999999999999999"] {
            assert!(bad.parse::<JobId>().is_err(), "{bad:?} should be rejected");
        }
        assert!(JobId::from_bytes(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn lock_key_is_namespaced() {
        assert_eq!(JobId::new(12).unwrap().lock_key(), "job:lock:12");
    }

    proptest! {
        #[test]
        fn wire_encoding_is_reversible(raw in 1i64..i64::MAX) {
            let id = JobId::new(raw).unwrap();
            prop_assert_eq!(JobId::from_bytes(&id.to_bytes()).unwrap(), id);
        }
    }
}
