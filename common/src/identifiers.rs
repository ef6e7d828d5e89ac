//! Identifier types for ledger entities.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{LedgerError, Result};

/// Longest accepted account identifier (an email address fits).
pub const MAX_ACCOUNT_ID_LEN: usize = 254;

/// Longest accepted external settlement identifier.
pub const MAX_SETTLEMENT_ID_LEN: usize = 128;

fn validate(kind: &'static str, value: &str, max_len: usize) -> Result<()> {
    let valid = !value.is_empty()
        && value.len() <= max_len
        && value.trim() == value
        && !value.chars().any(char::is_control);

    if valid {
        Ok(())
    } else {
        Err(LedgerError::InvalidIdentifier {
            kind,
            value: value.to_string(),
        })
    }
}

/// Opaque account identity, for example an email address or user id.
///
/// Ordering is lexicographic on the raw string, which is the global order
/// account locks are taken in.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    /// Create a validated account ID.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        validate("account", &id, MAX_ACCOUNT_ID_LEN)?;
        Ok(Self(id))
    }

    /// Get the ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<&str> for AccountId {
    type Error = LedgerError;

    fn try_from(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// Identifier assigned by the payment processor to one capture event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SettlementId(String);

impl SettlementId {
    /// Create a validated settlement ID.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        validate("settlement", &id, MAX_SETTLEMENT_ID_LEN)?;
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SettlementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<&str> for SettlementId {
    type Error = LedgerError;

    fn try_from(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// Unique identifier for a ledger entry.
/// Uses UUID v7 for time-ordered identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(Uuid);

impl EntryId {
    /// Create a new entry ID.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Parse from string.
    pub fn parse(s: &str) -> std::result::Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_id_creation() {
        let id1 = EntryId::new();
        let id2 = EntryId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_entry_id_parse() {
        let uuid_str = "019456ab-1234-7def-8901-234567890abc";
        let id = EntryId::parse(uuid_str).unwrap();
        assert_eq!(id.to_string(), uuid_str);
    }

    #[test]
    fn test_account_id_validation() {
        assert!(AccountId::new("alice@example.com").is_ok());
        assert!(AccountId::new("user_42").is_ok());
        assert!(AccountId::new("").is_err());
        assert!(AccountId::new(" alice").is_err());
        assert!(AccountId::new("bob\n").is_err());
        assert!(AccountId::new("x".repeat(MAX_ACCOUNT_ID_LEN + 1)).is_err());
    }

    #[test]
    fn test_account_ids_order_lexicographically() {
        let alice = AccountId::new("alice").unwrap();
        let bob = AccountId::new("bob").unwrap();
        assert!(alice < bob);
    }

    #[test]
    fn test_settlement_id_validation() {
        assert!(SettlementId::new("5O190127TN364715T").is_ok());
        assert!(SettlementId::new("").is_err());
        assert!(SettlementId::new("x".repeat(MAX_SETTLEMENT_ID_LEN + 1)).is_err());
    }
}
