//! Simulated wallet users.

use aurapay_common::{AccountId, Result};

/// A simulated wallet holder.
#[derive(Debug, Clone)]
pub struct SimulatedUser {
    /// Ledger account.
    pub account: AccountId,
    /// Display name.
    pub name: String,
}

impl SimulatedUser {
    pub fn new(email: &str, name: impl Into<String>) -> Result<Self> {
        Ok(Self {
            account: AccountId::new(email)?,
            name: name.into(),
        })
    }
}

/// Builds the user population for a run.
pub struct UserFactory;

impl UserFactory {
    /// Create `count` users with stable email-style account ids.
    pub fn create_users(count: usize) -> Result<Vec<SimulatedUser>> {
        const NAMES: [&str; 8] = [
            "alice", "bob", "carol", "dave", "erin", "frank", "grace", "heidi",
        ];

        (0..count)
            .map(|i| match NAMES.get(i) {
                Some(name) => SimulatedUser::new(&format!("{name}@example.com"), *name),
                None => {
                    let name = format!("user{}", i + 1);
                    SimulatedUser::new(&format!("{name}@example.com"), name)
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_users() {
        let users = UserFactory::create_users(10).unwrap();
        assert_eq!(users.len(), 10);
        assert_eq!(users[0].account.as_str(), "alice@example.com");
        assert_eq!(users[9].account.as_str(), "user10@example.com");
    }
}
