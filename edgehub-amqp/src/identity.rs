//! Client identities and the authentication state of a connection

use std::fmt;

/// Identity of a device or of a module running on a device
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    pub iot_hub_host_name: String,
    pub device_id: String,
    pub module_id: Option<String>,
}

impl Identity {
    /// Creates a device identity
    pub fn device(iot_hub_host_name: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            iot_hub_host_name: iot_hub_host_name.into(),
            device_id: device_id.into(),
            module_id: None,
        }
    }

    /// Creates a module identity
    pub fn module(
        iot_hub_host_name: impl Into<String>,
        device_id: impl Into<String>,
        module_id: impl Into<String>,
    ) -> Self {
        Self {
            iot_hub_host_name: iot_hub_host_name.into(),
            device_id: device_id.into(),
            module_id: Some(module_id.into()),
        }
    }

    /// Client id, `deviceId` or `deviceId/moduleId`
    pub fn id(&self) -> String {
        client_id(&self.device_id, self.module_id.as_deref())
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.module_id {
            Some(module_id) => write!(f, "{}/{}", self.device_id, module_id),
            None => write!(f, "{}", self.device_id),
        }
    }
}

pub(crate) fn client_id(device_id: &str, module_id: Option<&str>) -> String {
    match module_id {
        Some(module_id) => format!("{}/{}", device_id, module_id),
        None => device_id.to_string(),
    }
}

/// Outcome of authenticating a connection, either through CBS or SASL PLAIN.
///
/// The value is immutable, re-authentication replaces it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AmqpAuthentication {
    pub is_authenticated: bool,
    pub identity: Option<Identity>,
}

impl AmqpAuthentication {
    /// Authenticated as `identity`
    pub fn authenticated(identity: Identity) -> Self {
        Self {
            is_authenticated: true,
            identity: Some(identity),
        }
    }

    /// Not authenticated, optionally keeping the identity that was claimed
    pub fn unauthenticated(identity: impl Into<Option<Identity>>) -> Self {
        Self {
            is_authenticated: false,
            identity: identity.into(),
        }
    }

    /// Whether this authentication holds for the client id `id`
    pub fn is_authenticated_for(&self, id: &str) -> bool {
        self.is_authenticated
            && self
                .identity
                .as_ref()
                .map(|identity| identity.id() == id)
                .unwrap_or(false)
    }
}
