//! SASL PLAIN identities and the per-connection SASL acceptor

use std::sync::Arc;

use fe2o3_amqp::acceptor::sasl_acceptor::{SaslAcceptor, SaslServerFrame};
use fe2o3_amqp_types::{
    primitives::{Array, Symbol},
    sasl::{SaslCode, SaslInit, SaslOutcome, SaslResponse},
};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{auth::AuthenticationType, error::SaslIdentityError};

/// SASL PLAIN mechanism
pub const PLAIN: &str = "PLAIN";

/// SASL ANONYMOUS mechanism, used by clients that authenticate through CBS
pub const ANONYMOUS: &str = "ANONYMOUS";

const SAS_HOST_PREFIX: &str = "sas.";
const MODULES_SEGMENT: &str = "modules";

/// Identity carried in the username of a SASL PLAIN exchange
///
/// | username | auth type |
/// |---|---|
/// | `deviceId/modules/moduleId@sas.<hub>` | SAS token, module |
/// | `deviceId@sas.<hub>` | SAS token, device |
/// | `deviceId/modules/moduleId@<anything>` | shared key, module |
/// | `deviceId@<anything>` | shared key, device |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaslIdentity {
    pub device_id: String,
    pub module_id: Option<String>,
    pub auth_type: AuthenticationType,

    /// Whatever follows `sas.`, only present for non-empty SAS token identities
    pub iot_hub_name: Option<String>,
}

impl SaslIdentity {
    /// Parses a SASL PLAIN username. Matching is syntactic only.
    pub fn parse(input: &str) -> Result<Self, SaslIdentityError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(SaslIdentityError::Empty);
        }
        let unrecognized = || SaslIdentityError::Unrecognized(input.to_string());

        let (id_part, host_part) = input.split_once('@').ok_or_else(unrecognized)?;
        if host_part.is_empty() || host_part.contains('@') {
            return Err(unrecognized());
        }

        let segments: Vec<&str> = id_part.split('/').collect();
        let (device_id, module_id) = match segments.as_slice() {
            [device_id] => (*device_id, None),
            [device_id, MODULES_SEGMENT, module_id] => (*device_id, Some(*module_id)),
            _ => return Err(unrecognized()),
        };
        if !is_valid_segment(device_id) || !module_id.map(is_valid_segment).unwrap_or(true) {
            return Err(unrecognized());
        }

        let (auth_type, iot_hub_name) = match host_part.strip_prefix(SAS_HOST_PREFIX) {
            Some(hub) => (
                AuthenticationType::Token,
                Some(hub.to_string()).filter(|hub| !hub.is_empty()),
            ),
            None => (AuthenticationType::SasKey, None),
        };

        Ok(Self {
            device_id: device_id.to_string(),
            module_id: module_id.map(Into::into),
            auth_type,
            iot_hub_name,
        })
    }
}

fn is_valid_segment(segment: &str) -> bool {
    !segment.is_empty() && !segment.contains(|c: char| c == '/' || c.is_whitespace())
}

/// Identity and secret recorded by a successful SASL PLAIN exchange
#[derive(Clone, PartialEq, Eq)]
pub struct SaslPrincipal {
    pub identity: SaslIdentity,
    pub password: String,
}

impl std::fmt::Debug for SaslPrincipal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaslPrincipal")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

/// SASL acceptor of a single connection.
///
/// PLAIN usernames are only checked for their shape here, the credentials are verified by the
/// [`Authenticator`](crate::auth::Authenticator) when the connection first resolves its
/// authentication. ANONYMOUS is accepted so that clients can authenticate through CBS.
#[derive(Debug, Clone, Default)]
pub struct SaslPlainAcceptor {
    principal: Arc<Mutex<Option<SaslPrincipal>>>,
}

impl SaslPlainAcceptor {
    /// Creates a new acceptor with no principal
    pub fn new() -> Self {
        Self::default()
    }

    /// Principal recorded by the PLAIN exchange, if any
    pub fn principal(&self) -> Option<SaslPrincipal> {
        self.principal.lock().clone()
    }

    fn on_plain(&self, initial_response: Option<Vec<u8>>) -> SaslCode {
        let principal = initial_response.as_deref().and_then(|response| {
            let mut split = response.split(|b| *b == 0u8);
            let _authzid = split.next()?;
            let authcid = std::str::from_utf8(split.next()?).ok()?;
            let passwd = std::str::from_utf8(split.next()?).ok()?;
            match SaslIdentity::parse(authcid) {
                Ok(identity) => Some(SaslPrincipal {
                    identity,
                    password: passwd.to_string(),
                }),
                Err(err) => {
                    warn!(%err, "Rejecting SASL PLAIN identity");
                    None
                }
            }
        });

        match principal {
            Some(principal) => {
                debug!(identity = ?principal.identity, "SASL PLAIN identity accepted");
                *self.principal.lock() = Some(principal);
                SaslCode::Ok
            }
            None => SaslCode::Auth,
        }
    }
}

impl SaslAcceptor for SaslPlainAcceptor {
    fn mechanisms(&self) -> Array<Symbol> {
        Array::from(vec![Symbol::from(PLAIN), Symbol::from(ANONYMOUS)])
    }

    fn on_init(&mut self, init: SaslInit) -> SaslServerFrame {
        let code = match init.mechanism.as_str() {
            PLAIN => self.on_plain(init.initial_response.map(|b| b.into_vec())),
            ANONYMOUS => SaslCode::Ok,
            _ => SaslCode::Auth,
        };
        SaslServerFrame::Outcome(SaslOutcome {
            code,
            additional_data: None,
        })
    }

    fn on_response(&mut self, _response: SaslResponse) -> SaslServerFrame {
        // Neither PLAIN nor ANONYMOUS issue challenges
        SaslServerFrame::Outcome(SaslOutcome {
            code: SaslCode::Sys,
            additional_data: None,
        })
    }
}
