//! Claims-based security node of a connection
//!
//! Devices authenticate by sending a put-token request on a receiving `$cbs` link. The node
//! validates the request, authenticates the SAS token and answers on the sending `$cbs` link.
//! The outcome is cached as the [`AmqpAuthentication`] of the connection.

use std::sync::Arc;

use fe2o3_amqp_types::{
    messaging::{AmqpValue, ApplicationProperties, Body, Message, Properties},
    primitives::{SimpleValue, Value},
};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, instrument, warn};

use crate::{
    auth::{Authenticator, ClientCredentialsFactory},
    constants::{
        NAME, OPERATION, PUT_TOKEN, SAS_TOKEN_TYPE, STATUS_CODE, STATUS_DESCRIPTION, TYPE,
    },
    error::{CbsError, LinkError, ResolveError},
    identity::{AmqpAuthentication, Identity},
    link::{LinkDirection, OutboundMessage, OutboundSender},
    message::{converter::simple_value_to_string, AmqpMessage},
};

const DEVICES_SEGMENT: &str = "devices";
const MODULES_SEGMENT: &str = "modules";

/// Status code of a put-token response
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Eq, Ord, Hash)]
pub struct StatusCode(pub u16);

impl StatusCode {
    pub const OK: StatusCode = StatusCode(200);
    pub const BAD_REQUEST: StatusCode = StatusCode(400);
    pub const UNAUTHORIZED: StatusCode = StatusCode(401);
    pub const INTERNAL_SERVER_ERROR: StatusCode = StatusCode(500);

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.0)
    }
}

#[derive(Default)]
struct CbsLinks {
    receiving: Option<String>,
    sending: Option<Arc<dyn OutboundSender>>,
}

/// The CBS node of a single connection
pub struct CbsNode {
    iot_hub_host_name: String,
    authenticator: Arc<dyn Authenticator>,
    credentials_factory: Arc<dyn ClientCredentialsFactory>,
    links: Mutex<CbsLinks>,
    authentication: watch::Sender<Option<AmqpAuthentication>>,
}

impl std::fmt::Debug for CbsNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CbsNode")
            .field("iot_hub_host_name", &self.iot_hub_host_name)
            .field("authentication", &*self.authentication.borrow())
            .finish()
    }
}

impl CbsNode {
    pub fn new(
        iot_hub_host_name: impl Into<String>,
        authenticator: Arc<dyn Authenticator>,
        credentials_factory: Arc<dyn ClientCredentialsFactory>,
    ) -> Self {
        let (authentication, _) = watch::channel(None);
        Self {
            iot_hub_host_name: iot_hub_host_name.into(),
            authenticator,
            credentials_factory,
            links: Mutex::new(CbsLinks::default()),
            authentication,
        }
    }

    /// Registers the link put-token requests arrive on
    pub fn register_receiving_link(&self, link_name: &str) -> Result<(), CbsError> {
        let mut links = self.links.lock();
        if links.receiving.is_some() {
            return Err(CbsError::LinkAlreadyRegistered(LinkDirection::Receiving));
        }
        links.receiving = Some(link_name.to_string());
        Ok(())
    }

    /// Registers the link put-token responses are sent on
    pub fn register_sending_link(&self, sender: Arc<dyn OutboundSender>) -> Result<(), CbsError> {
        let mut links = self.links.lock();
        if links.sending.is_some() {
            return Err(CbsError::LinkAlreadyRegistered(LinkDirection::Sending));
        }
        links.sending = Some(sender);
        Ok(())
    }

    /// Removes a registration if it still belongs to `link_name`
    pub fn deregister_link(&self, direction: LinkDirection, link_name: &str) {
        let mut links = self.links.lock();
        match direction {
            LinkDirection::Receiving => {
                if links.receiving.as_deref() == Some(link_name) {
                    links.receiving = None;
                }
            }
            LinkDirection::Sending => {
                if links
                    .sending
                    .as_ref()
                    .map(|s| s.link_name() == link_name)
                    .unwrap_or(false)
                {
                    links.sending = None;
                }
            }
        }
    }

    /// Checks the shape of a put-token request and returns `(token, audience)`
    pub fn validate_and_parse_message(
        &self,
        message: &AmqpMessage,
    ) -> Result<(String, String), CbsError> {
        let application_properties = message
            .application_properties
            .as_ref()
            .ok_or_else(|| invalid("missing application properties"))?;
        let property = |key: &str| {
            application_properties
                .iter()
                .find(|(k, _)| k.as_str() == key)
                .and_then(|(_, v)| simple_value_to_string(v))
        };

        if property(TYPE).as_deref() != Some(SAS_TOKEN_TYPE) {
            return Err(invalid("unsupported token type"));
        }
        if property(OPERATION).as_deref() != Some(PUT_TOKEN) {
            return Err(invalid("unsupported operation"));
        }
        let audience = property(NAME)
            .filter(|name| !name.trim().is_empty())
            .ok_or_else(|| invalid("missing audience"))?;

        let token = match &message.body {
            Body::Value(AmqpValue(Value::String(token))) => token.clone(),
            _ => return Err(invalid("token must be a string value")),
        };

        Ok((token, audience))
    }

    /// Parses the device and module id out of an audience of the form
    /// `{host}/devices/{deviceId}` or `{host}/devices/{deviceId}/modules/{moduleId}`
    pub fn parse_ids(audience: &str) -> Result<(String, Option<String>), CbsError> {
        let segments: Vec<&str> = audience.trim().split('/').collect();
        match segments.as_slice() {
            [host, DEVICES_SEGMENT, device_id] if !host.is_empty() && !device_id.is_empty() => {
                Ok((device_id.to_string(), None))
            }
            [host, DEVICES_SEGMENT, device_id, MODULES_SEGMENT, module_id]
                if !host.is_empty() && !device_id.is_empty() && !module_id.is_empty() =>
            {
                Ok((device_id.to_string(), Some(module_id.to_string())))
            }
            _ => Err(invalid(format!("invalid audience {:?}", audience))),
        }
    }

    /// Identity claimed by a put-token request, without authenticating it
    pub fn get_identity(&self, message: &AmqpMessage) -> Result<Identity, CbsError> {
        self.parse_request(message).map(|(identity, _)| identity)
    }

    fn parse_request(&self, message: &AmqpMessage) -> Result<(Identity, String), CbsError> {
        let (token, audience) = self.validate_and_parse_message(message)?;
        let (device_id, module_id) = Self::parse_ids(&audience)?;
        let identity = Identity {
            iot_hub_host_name: self.iot_hub_host_name.clone(),
            device_id,
            module_id,
        };
        Ok((identity, token))
    }

    /// Authenticates a put-token request and caches the result.
    ///
    /// Malformed requests yield `400` and leave the cache untouched. Rejected tokens yield `401`
    /// and cache an unauthenticated value. Authenticator failures yield `500`.
    #[instrument(skip_all)]
    pub async fn update_cbs_token(
        &self,
        message: &AmqpMessage,
    ) -> (AmqpAuthentication, StatusCode, String) {
        let (identity, token) = match self.parse_request(message) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(%err, "Malformed put-token request");
                return (
                    AmqpAuthentication::unauthenticated(None),
                    StatusCode::BAD_REQUEST,
                    err.to_string(),
                );
            }
        };

        let credentials = self
            .credentials_factory
            .with_sas_token(identity.clone(), token);
        match self.authenticator.authenticate(&credentials).await {
            Ok(true) => {
                debug!(%identity, "Put-token authenticated");
                let authentication = AmqpAuthentication::authenticated(identity);
                self.authentication.send_replace(Some(authentication.clone()));
                (authentication, StatusCode::OK, "OK".to_string())
            }
            Ok(false) => {
                warn!(%identity, "Put-token rejected");
                let authentication = AmqpAuthentication::unauthenticated(identity);
                self.authentication.send_replace(Some(authentication.clone()));
                (
                    authentication,
                    StatusCode::UNAUTHORIZED,
                    "Unauthorized".to_string(),
                )
            }
            Err(err) => {
                warn!(%identity, %err, "Authenticator failed");
                (
                    AmqpAuthentication::unauthenticated(identity),
                    StatusCode::INTERNAL_SERVER_ERROR,
                    err.to_string(),
                )
            }
        }
    }

    /// Handles a put-token request and builds the response message
    pub async fn handle_put_token_request(&self, request: &AmqpMessage) -> AmqpMessage {
        let (_, status, description) = self.update_cbs_token(request).await;

        let mut properties = Properties::default();
        properties.correlation_id = request
            .properties
            .as_ref()
            .and_then(|p| p.message_id.clone());
        let application_properties = ApplicationProperties::builder()
            .insert(STATUS_CODE.to_string(), SimpleValue::Int(i32::from(status.0)))
            .insert(STATUS_DESCRIPTION.to_string(), SimpleValue::String(description))
            .build();

        Message {
            header: None,
            delivery_annotations: None,
            message_annotations: None,
            properties: Some(properties),
            application_properties: Some(application_properties),
            body: Body::Value(AmqpValue(Value::Null)),
            footer: None,
        }
    }

    /// Sends a response on the registered sending `$cbs` link
    pub async fn send_response(&self, response: AmqpMessage) -> Result<(), LinkError> {
        let sender = self.links.lock().sending.clone();
        match sender {
            Some(sender) => sender.send(OutboundMessage::Raw(response)).await,
            None => {
                warn!("No sending $cbs link, dropping put-token response");
                Ok(())
            }
        }
    }

    /// Whether the cached authentication holds for the client id `id`
    pub fn authenticate(&self, id: &str) -> bool {
        self.authentication
            .borrow()
            .as_ref()
            .map(|auth| auth.is_authenticated_for(id))
            .unwrap_or(false)
    }

    /// The cached authentication, if any put-token request completed
    pub fn current_authentication(&self) -> Option<AmqpAuthentication> {
        self.authentication.borrow().clone()
    }

    /// Waits for the first put-token outcome and returns the cached authentication
    pub async fn amqp_authentication(&self) -> Result<AmqpAuthentication, ResolveError> {
        let mut rx = self.authentication.subscribe();
        loop {
            if let Some(authentication) = rx.borrow_and_update().clone() {
                return Ok(authentication);
            }
            rx.changed().await.map_err(|_| ResolveError::Closed)?;
        }
    }
}

fn invalid(msg: impl Into<String>) -> CbsError {
    CbsError::InvalidOperation(msg.into())
}
