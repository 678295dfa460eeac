//! Credentials and the authenticator seam

use std::fmt;

use async_trait::async_trait;

use crate::{error::ListenerError, identity::Identity};

/// How a client proves its identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthenticationType {
    /// Shared access signature token
    Token,

    /// Shared access key
    SasKey,
}

/// Credentials presented by a client
#[derive(Clone, PartialEq, Eq)]
pub struct ClientCredentials {
    pub identity: Identity,
    pub auth_type: AuthenticationType,
    pub token: String,
}

impl fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("identity", &self.identity)
            .field("auth_type", &self.auth_type)
            .field("token", &"***")
            .finish()
    }
}

/// Checks client credentials
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Returns `Ok(false)` when the credentials are rejected
    async fn authenticate(&self, credentials: &ClientCredentials) -> Result<bool, ListenerError>;
}

/// Builds [`ClientCredentials`] for an identity
pub trait ClientCredentialsFactory: Send + Sync {
    /// Credentials from a SAS token
    fn with_sas_token(&self, identity: Identity, token: String) -> ClientCredentials;

    /// Credentials from a shared access key
    fn with_shared_key(&self, identity: Identity, key: String) -> ClientCredentials;
}

/// Default factory that attaches the secret to the identity unchanged
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityCredentialsFactory;

impl ClientCredentialsFactory for IdentityCredentialsFactory {
    fn with_sas_token(&self, identity: Identity, token: String) -> ClientCredentials {
        ClientCredentials {
            identity,
            auth_type: AuthenticationType::Token,
            token,
        }
    }

    fn with_shared_key(&self, identity: Identity, key: String) -> ClientCredentials {
        ClientCredentials {
            identity,
            auth_type: AuthenticationType::SasKey,
            token: key,
        }
    }
}
