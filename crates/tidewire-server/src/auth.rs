//! Identity validation during the handshake

use crate::{Result, ServerError};
use async_trait::async_trait;
use tidewire_proto::IdentityReply;

/// Identity and roles attached to a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    /// Identity the session is registered under
    pub identity: String,
    /// Roles granted by the auth provider
    pub roles: Vec<String>,
}

impl Principal {
    /// Create a principal without roles
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            roles: Vec::new(),
        }
    }

    /// Add roles
    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles.extend(roles.into_iter().map(Into::into));
        self
    }

    /// Check for a role
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// Validates the identity a client reports during the handshake
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Accept the reply and yield a principal, or fail with [`ServerError::Auth`]
    async fn authenticate(&self, reply: &IdentityReply) -> Result<Principal>;
}

/// Accepts every identity without roles
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl AuthProvider for AllowAll {
    async fn authenticate(&self, reply: &IdentityReply) -> Result<Principal> {
        if reply.identity.is_empty() {
            return Err(ServerError::Auth("empty identity".to_string()));
        }
        Ok(Principal::new(reply.identity.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(identity: &str) -> IdentityReply {
        IdentityReply {
            identity: identity.to_string(),
            client_name: None,
            credential: None,
        }
    }

    #[tokio::test]
    async fn test_allow_all() {
        let principal = AllowAll.authenticate(&reply("client-1")).await.unwrap();
        assert_eq!(principal, Principal::new("client-1"));
        assert!(!principal.has_role("admin"));
    }

    #[tokio::test]
    async fn test_allow_all_rejects_empty_identity() {
        assert!(matches!(AllowAll.authenticate(&reply("")).await, Err(ServerError::Auth(_))));
    }

    #[test]
    fn test_principal_roles() {
        let principal = Principal::new("a").with_roles(["admin", "viewer"]);
        assert!(principal.has_role("admin"));
        assert!(principal.has_role("viewer"));
        assert!(!principal.has_role("root"));
    }
}
