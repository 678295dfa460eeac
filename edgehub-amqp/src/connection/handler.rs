//! Per-connection resolution of the authentication and of the device listener

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::{
    auth::{AuthenticationType, Authenticator, ClientCredentialsFactory},
    cbs::CbsNode,
    device::{ConnectionProvider, DeviceListener},
    error::ResolveError,
    identity::{AmqpAuthentication, Identity},
    link::OutboundSender,
    sasl::SaslPrincipal,
    util::SingleFlight,
};

use super::{DeviceCapability, DeviceProxy};

/// Everything needed to resolve the authentication of a connection
#[derive(Clone)]
struct AuthenticationSource {
    cbs: Arc<CbsNode>,
    sasl_principal: Option<SaslPrincipal>,
    iot_hub_host_name: String,
    authenticator: Arc<dyn Authenticator>,
    credentials_factory: Arc<dyn ClientCredentialsFactory>,
}

impl AuthenticationSource {
    async fn resolve(self) -> Result<AmqpAuthentication, ResolveError> {
        let authentication = match self.sasl_principal {
            Some(principal) => {
                let identity = Identity {
                    iot_hub_host_name: self.iot_hub_host_name,
                    device_id: principal.identity.device_id,
                    module_id: principal.identity.module_id,
                };
                let credentials = match principal.identity.auth_type {
                    AuthenticationType::Token => self
                        .credentials_factory
                        .with_sas_token(identity.clone(), principal.password),
                    AuthenticationType::SasKey => self
                        .credentials_factory
                        .with_shared_key(identity.clone(), principal.password),
                };
                if self.authenticator.authenticate(&credentials).await? {
                    AmqpAuthentication::authenticated(identity)
                } else {
                    AmqpAuthentication::unauthenticated(identity)
                }
            }
            None => self.cbs.amqp_authentication().await?,
        };

        if authentication.is_authenticated {
            Ok(authentication)
        } else {
            warn!(identity = ?authentication.identity, "Connection is not authenticated");
            Err(ResolveError::Unauthenticated)
        }
    }
}

/// Connection scoped state shared by every link of the connection
pub struct ConnectionHandler {
    source: AuthenticationSource,
    connection_provider: Arc<dyn ConnectionProvider>,
    device_proxy: Arc<DeviceProxy>,
    authentication: Arc<SingleFlight<AmqpAuthentication, ResolveError>>,
    listener: SingleFlight<Arc<dyn DeviceListener>, ResolveError>,
}

impl std::fmt::Debug for ConnectionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandler")
            .field("sasl_principal", &self.source.sasl_principal)
            .field("device_proxy", &self.device_proxy)
            .field("authentication", &self.authentication)
            .field("listener", &self.listener)
            .finish()
    }
}

impl ConnectionHandler {
    pub fn new(
        cbs: Arc<CbsNode>,
        sasl_principal: Option<SaslPrincipal>,
        iot_hub_host_name: impl Into<String>,
        connection_provider: Arc<dyn ConnectionProvider>,
        authenticator: Arc<dyn Authenticator>,
        credentials_factory: Arc<dyn ClientCredentialsFactory>,
    ) -> Self {
        Self {
            source: AuthenticationSource {
                cbs,
                sasl_principal,
                iot_hub_host_name: iot_hub_host_name.into(),
                authenticator,
                credentials_factory,
            },
            connection_provider,
            device_proxy: Arc::new(DeviceProxy::new()),
            authentication: Arc::new(SingleFlight::new()),
            listener: SingleFlight::new(),
        }
    }

    pub fn has_sasl_principal(&self) -> bool {
        self.source.sasl_principal.is_some()
    }

    pub fn device_proxy(&self) -> &Arc<DeviceProxy> {
        &self.device_proxy
    }

    /// Resolves the authentication of the connection once.
    ///
    /// Connections authenticated with SASL PLAIN check the recorded principal through the
    /// authenticator. Other connections wait for the first put-token request on the CBS node.
    pub async fn get_amqp_authentication(&self) -> Result<AmqpAuthentication, ResolveError> {
        let source = self.source.clone();
        self.authentication
            .get_or_try_init(move || source.resolve())
            .await
    }

    /// Resolves the device listener of the authenticated identity once and binds the device
    /// proxy of the connection to it.
    #[instrument(skip_all)]
    pub async fn get_device_listener(&self) -> Result<Arc<dyn DeviceListener>, ResolveError> {
        let authentication = self.authentication.clone();
        let source = self.source.clone();
        let provider = self.connection_provider.clone();
        let proxy = self.device_proxy.clone();

        self.listener
            .get_or_try_init(move || async move {
                let authentication = authentication
                    .get_or_try_init(move || source.resolve())
                    .await?;
                let identity = authentication
                    .identity
                    .ok_or(ResolveError::MissingIdentity)?;
                debug!(%identity, "Resolving device listener");
                let listener = provider.get_device_listener(identity).await?;
                listener.bind_device_proxy(proxy);
                Ok(listener)
            })
            .await
    }

    pub fn register_c2d_message_sender(&self, sender: Arc<dyn OutboundSender>) {
        self.device_proxy
            .register(DeviceCapability::C2DMessages, sender)
    }

    pub fn register_module_message_sender(&self, sender: Arc<dyn OutboundSender>) {
        self.device_proxy
            .register(DeviceCapability::ModuleMessages, sender)
    }

    pub fn register_method_invoker(&self, sender: Arc<dyn OutboundSender>) {
        self.device_proxy
            .register(DeviceCapability::MethodInvoker, sender)
    }

    pub fn register_desired_properties_update_sender(&self, sender: Arc<dyn OutboundSender>) {
        self.device_proxy
            .register(DeviceCapability::DesiredPropertyUpdates, sender)
    }

    pub fn register_twin_response_sender(&self, sender: Arc<dyn OutboundSender>) {
        self.device_proxy
            .register(DeviceCapability::TwinResponses, sender)
    }

    /// Removes a registration made by `link_name`
    pub fn deregister(&self, capability: DeviceCapability, link_name: &str) {
        self.device_proxy.deregister(capability, link_name)
    }

    /// Drops every registration of the connection
    pub fn close(&self) {
        self.device_proxy.clear();
    }
}
