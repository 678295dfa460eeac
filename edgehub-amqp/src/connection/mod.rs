//! Connection scoped state

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::{
    auth::{Authenticator, ClientCredentialsFactory},
    cbs::CbsNode,
    device::ConnectionProvider,
    sasl::SaslPrincipal,
};

mod handler;
mod proxy;

pub use handler::ConnectionHandler;
pub use proxy::{DeviceCapability, DeviceProxy};

/// State shared by every link of one AMQP connection
#[derive(Debug)]
pub struct ConnectionContext {
    pub cbs: Arc<CbsNode>,
    pub handler: Arc<ConnectionHandler>,
    pub sasl_principal: Option<SaslPrincipal>,
    pub iot_hub_host_name: String,

    /// Maximum encoded size of a received message
    pub max_message_size: u64,

    /// Cancelled when the connection ends. Link handlers hold child tokens.
    pub shutdown: CancellationToken,
}

impl ConnectionContext {
    pub fn new(
        iot_hub_host_name: impl Into<String>,
        sasl_principal: Option<SaslPrincipal>,
        max_message_size: u64,
        connection_provider: Arc<dyn ConnectionProvider>,
        authenticator: Arc<dyn Authenticator>,
        credentials_factory: Arc<dyn ClientCredentialsFactory>,
    ) -> Self {
        let iot_hub_host_name = iot_hub_host_name.into();
        let cbs = Arc::new(CbsNode::new(
            iot_hub_host_name.clone(),
            authenticator.clone(),
            credentials_factory.clone(),
        ));
        let handler = Arc::new(ConnectionHandler::new(
            cbs.clone(),
            sasl_principal.clone(),
            iot_hub_host_name.clone(),
            connection_provider,
            authenticator,
            credentials_factory,
        ));
        Self {
            cbs,
            handler,
            sasl_principal,
            iot_hub_host_name,
            max_message_size,
            shutdown: CancellationToken::new(),
        }
    }

    /// Ends the connection scoped state: link handlers stop and every device proxy
    /// registration is dropped
    pub fn close(&self) {
        self.shutdown.cancel();
        self.handler.close();
    }
}
