//! A minimal `CredentialVerifier` backed by the static user table loaded
//! from configuration, per spec.md §9 Open Question (b): a production
//! embedder supplies their own verifier against a real credential store;
//! this one exists so `AUTH` works out of the box.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::smtp::server::CredentialVerifier;

pub struct StaticCredentialVerifier {
    users: HashMap<String, String>,
}

impl StaticCredentialVerifier {
    pub fn new(users: Vec<(String, String)>) -> Self {
        StaticCredentialVerifier {
            users: users.into_iter().collect(),
        }
    }
}

#[async_trait]
impl CredentialVerifier for StaticCredentialVerifier {
    async fn verify_plain(&self, authcid: &str, password: &str) -> bool {
        self.users.get(authcid).map(|p| p == password).unwrap_or(false)
    }

    async fn lookup_cram_secret(&self, identity: &str) -> Option<String> {
        self.users.get(identity).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn verifies_known_user() {
        let verifier = StaticCredentialVerifier::new(vec![("alice".to_string(), "hunter2".to_string())]);
        assert!(verifier.verify_plain("alice", "hunter2").await);
        assert!(!verifier.verify_plain("alice", "wrong").await);
        assert!(!verifier.verify_plain("bob", "anything").await);
    }

    #[tokio::test]
    async fn looks_up_cram_secret() {
        let verifier = StaticCredentialVerifier::new(vec![("alice".to_string(), "hunter2".to_string())]);
        assert_eq!(verifier.lookup_cram_secret("alice").await, Some("hunter2".to_string()));
        assert_eq!(verifier.lookup_cram_secret("bob").await, None);
    }
}
