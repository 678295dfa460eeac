//! fe2o3-amqp backed connections

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use fe2o3_amqp::{
    acceptor::{
        session::ListenerSessionHandle, ConnectionAcceptor, LinkAcceptor, LinkEndpoint,
        ListenerConnectionHandle, SessionAcceptor, SupportedReceiverSettleModes,
        SupportedSenderSettleModes,
    },
    types::performatives::Attach,
};
use fe2o3_amqp_types::{
    definitions::{ReceiverSettleMode, Role, SenderSettleMode},
    messaging::{Source, Target},
};
use tracing::{debug, instrument, trace, warn};

use crate::{
    auth::{Authenticator, ClientCredentialsFactory},
    connection::ConnectionContext,
    device::ConnectionProvider,
    error::ConnectionError,
    head::{AmqpConnection, RuntimeProvider},
    link::{
        AttachedLink, Fe2o3ReceivingLink, Fe2o3SendingLink, LinkDirection, LinkHandlerProvider,
        QualityOfService,
    },
    sasl::SaslPlainAcceptor,
    settings::AmqpSettings,
    transport::Transport,
};

/// [`RuntimeProvider`] creating fe2o3-amqp connections
pub struct Fe2o3Runtime {
    settings: AmqpSettings,
    connection_provider: Arc<dyn ConnectionProvider>,
    authenticator: Arc<dyn Authenticator>,
    credentials_factory: Arc<dyn ClientCredentialsFactory>,
    link_provider: Arc<LinkHandlerProvider>,
}

impl std::fmt::Debug for Fe2o3Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fe2o3Runtime")
            .field("settings", &self.settings)
            .field("link_provider", &self.link_provider)
            .finish()
    }
}

impl Fe2o3Runtime {
    pub fn new(
        settings: AmqpSettings,
        connection_provider: Arc<dyn ConnectionProvider>,
        authenticator: Arc<dyn Authenticator>,
        credentials_factory: Arc<dyn ClientCredentialsFactory>,
    ) -> Self {
        Self {
            settings,
            connection_provider,
            authenticator,
            credentials_factory,
            link_provider: Arc::new(LinkHandlerProvider::default()),
        }
    }

    /// Replaces the default link dispatch table
    pub fn with_link_provider(mut self, link_provider: LinkHandlerProvider) -> Self {
        self.link_provider = Arc::new(link_provider);
        self
    }
}

#[async_trait]
impl RuntimeProvider for Fe2o3Runtime {
    async fn create_connection(
        &self,
        transport: Transport,
    ) -> Result<Box<dyn AmqpConnection>, ConnectionError> {
        Ok(Box::new(Fe2o3Connection {
            settings: self.settings.clone(),
            connection_provider: self.connection_provider.clone(),
            authenticator: self.authenticator.clone(),
            credentials_factory: self.credentials_factory.clone(),
            link_provider: self.link_provider.clone(),
            transport: Some(transport),
            connection: None,
            context: None,
        }))
    }
}

/// Link acceptor without dynamic source or target handlers
type AttachAcceptor = LinkAcceptor<fn(Source) -> Option<Source>, fn(Target) -> Option<Target>>;

struct Fe2o3Connection {
    settings: AmqpSettings,
    connection_provider: Arc<dyn ConnectionProvider>,
    authenticator: Arc<dyn Authenticator>,
    credentials_factory: Arc<dyn ClientCredentialsFactory>,
    link_provider: Arc<LinkHandlerProvider>,
    transport: Option<Transport>,
    connection: Option<ListenerConnectionHandle>,
    context: Option<Arc<ConnectionContext>>,
}

#[async_trait]
impl AmqpConnection for Fe2o3Connection {
    async fn open(&mut self, timeout: Duration) -> Result<(), ConnectionError> {
        let transport = self
            .transport
            .take()
            .ok_or_else(|| ConnectionError::Create("connection is already open".to_string()))?;

        let sasl_acceptor = SaslPlainAcceptor::new();
        let acceptor = ConnectionAcceptor::builder()
            .container_id(self.settings.container_id.clone())
            .hostname(Some(self.settings.iot_hub_host_name.clone()))
            .max_frame_size(self.settings.max_frame_size)
            .sasl_acceptor(sasl_acceptor.clone())
            .build();

        let connection = tokio::time::timeout(timeout, acceptor.accept(transport.stream))
            .await
            .map_err(|_| ConnectionError::Timeout)?
            .map_err(|err| ConnectionError::Engine(Box::new(err)))?;
        self.connection = Some(connection);

        let principal = sasl_acceptor.principal();
        debug!(principal = ?principal.as_ref().map(|p| &p.identity), "AMQP connection opened");
        self.context = Some(Arc::new(ConnectionContext::new(
            self.settings.iot_hub_host_name.clone(),
            principal,
            self.settings.max_message_size,
            self.connection_provider.clone(),
            self.authenticator.clone(),
            self.credentials_factory.clone(),
        )));
        Ok(())
    }

    #[instrument(skip_all)]
    async fn run(&mut self) -> Result<(), ConnectionError> {
        let (connection, context) = match (self.connection.as_mut(), self.context.clone()) {
            (Some(connection), Some(context)) => (connection, context),
            _ => return Err(ConnectionError::NotOpen),
        };

        let session_acceptor = SessionAcceptor::new();
        loop {
            let session = tokio::select! {
                _ = context.shutdown.cancelled() => break,
                session = session_acceptor.accept(connection) => session,
            };
            match session {
                Ok(session) => {
                    tokio::spawn(run_session(
                        session,
                        context.clone(),
                        self.link_provider.clone(),
                        self.settings.link_open_timeout,
                    ));
                }
                Err(err) => {
                    debug!(%err, "No more sessions");
                    break;
                }
            }
        }
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(context) = self.context.take() {
            context.close();
        }
        if let Some(mut connection) = self.connection.take() {
            match connection.close().await {
                Ok(()) => debug!("Connection closed"),
                Err(err) => debug!(%err, "Peer already disconnected"),
            }
        }
    }
}

#[instrument(skip_all)]
async fn run_session(
    mut session: ListenerSessionHandle,
    context: Arc<ConnectionContext>,
    link_provider: Arc<LinkHandlerProvider>,
    link_open_timeout: Duration,
) {
    loop {
        let attach = tokio::select! {
            _ = context.shutdown.cancelled() => break,
            attach = session.next_incoming_attach() => match attach {
                Some(attach) => patch_attach_if_needed(attach),
                None => break,
            },
        };

        let name = attach.name.clone();
        let acceptor = link_acceptor(&attach, &link_provider, context.max_message_size);
        match acceptor.accept_incoming_attach(attach, &mut session).await {
            Ok(endpoint) => {
                tokio::spawn(run_link(
                    name,
                    endpoint,
                    context.clone(),
                    link_provider.clone(),
                    link_open_timeout,
                ));
            }
            Err(err) => warn!(link = %name, %err, "Failed to accept link"),
        }
    }

    if let Err(err) = session.end().await {
        debug!(%err, "Session already ended");
    }
}

/// Builds the link acceptor of an incoming attach. Links we send on get the settle modes of
/// the quality of service of their address, the peer's settle modes are honored otherwise.
fn link_acceptor(
    attach: &Attach,
    link_provider: &LinkHandlerProvider,
    max_message_size: u64,
) -> AttachAcceptor {
    let builder = LinkAcceptor::builder().max_message_size(max_message_size);
    if !matches!(attach.role, Role::Receiver) {
        return builder.build();
    }

    let address = attach
        .source
        .as_ref()
        .and_then(|source| source.address.clone())
        .unwrap_or_default();
    let qos = link_provider
        .resolve(LinkDirection::Sending, &address)
        .map(|resolved| resolved.link_type.qos())
        .unwrap_or(QualityOfService::AtLeastOnce);
    let (snd_settle_mode, rcv_settle_mode) = qos.settle_modes();
    trace!(link = %attach.name, ?qos, "Negotiating settle modes");

    let supported_snd = match snd_settle_mode {
        SenderSettleMode::Settled => SupportedSenderSettleModes::Settled,
        SenderSettleMode::Unsettled => SupportedSenderSettleModes::Unsettled,
        SenderSettleMode::Mixed => SupportedSenderSettleModes::Mixed,
    };
    let supported_rcv = match rcv_settle_mode {
        ReceiverSettleMode::First => SupportedReceiverSettleModes::First,
        ReceiverSettleMode::Second => SupportedReceiverSettleModes::Second,
    };
    builder
        .supported_sender_settle_modes(supported_snd)
        .fallback_sender_settle_mode(snd_settle_mode)
        .supported_receiver_settle_modes(supported_rcv)
        .fallback_receiver_settle_mode(rcv_settle_mode)
        .build()
}

/// Some clients omit `initial-delivery-count` on sender attaches
fn patch_attach_if_needed(mut attach: Attach) -> Attach {
    if matches!(attach.role, Role::Sender) && attach.initial_delivery_count.is_none() {
        debug!(link = %attach.name, "Attach without initial-delivery-count");
        attach.initial_delivery_count = Some(0);
    }
    attach
}

#[instrument(skip_all, fields(link = %name))]
async fn run_link(
    name: String,
    endpoint: LinkEndpoint,
    context: Arc<ConnectionContext>,
    link_provider: Arc<LinkHandlerProvider>,
    link_open_timeout: Duration,
) {
    let (link, address) = match endpoint {
        LinkEndpoint::Sender(sender) => {
            let address = sender
                .source()
                .as_ref()
                .and_then(|source| source.address.clone())
                .unwrap_or_default();
            let link = Fe2o3SendingLink::new(name, sender);
            (AttachedLink::Sending(Box::new(link)), address)
        }
        LinkEndpoint::Receiver(receiver) => {
            let address = receiver
                .target()
                .as_ref()
                .and_then(|target| target.address.clone())
                .unwrap_or_default();
            let link = Fe2o3ReceivingLink::new(name, receiver);
            (AttachedLink::Receiving(Box::new(link)), address)
        }
    };

    let handler = match link_provider.create(link, &address, context).await {
        Ok(handler) => handler,
        Err(_) => return,
    };

    if let Err(err) = handler.open(link_open_timeout).await {
        warn!(%err, "Failed to open link");
        handler.close(Some(err.to_amqp_error())).await;
        return;
    }

    let result = handler.run().await;
    if let Err(err) = &result {
        debug!(%err, "Link stopped");
    }
    handler
        .close(result.err().map(|err| err.to_amqp_error()))
        .await;
}
