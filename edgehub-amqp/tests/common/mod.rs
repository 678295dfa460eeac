#![allow(dead_code)]

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use edgehub_amqp::{
    auth::{Authenticator, ClientCredentials, IdentityCredentialsFactory},
    connection::{ConnectionContext, DeviceProxy},
    device::{ConnectionProvider, DeviceListener},
    error::{LinkError, ListenerError},
    identity::Identity,
    link::{
        DeliveryOutcome, IncomingTransfer, OutgoingTransfer, ReceivingLink, SendingLink,
    },
    message::{AmqpMessage, DirectMethodResponse, FeedbackStatus, InternalMessage},
    sasl::{SaslIdentity, SaslPrincipal},
};
use fe2o3_amqp_types::{
    definitions,
    messaging::{AmqpValue, Body, Message, Properties},
    primitives::Value,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;

pub const HUB: &str = "hub.azure-devices.net";

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Calls made on a [`RecordingListener`]
#[derive(Debug, Clone, PartialEq)]
pub enum ListenerEvent {
    Batch(Vec<InternalMessage>),
    Feedback(String, FeedbackStatus),
    Subscribe(String),
    Unsubscribe(String),
    GetTwin(String),
    ReportedProperties(InternalMessage, String),
    MethodResponse(DirectMethodResponse),
}

pub struct RecordingListener {
    identity: Identity,
    proxy: Mutex<Option<Arc<DeviceProxy>>>,
    pub binds: AtomicUsize,
    events: mpsc::UnboundedSender<ListenerEvent>,
}

impl RecordingListener {
    /// The proxy bound by the connection
    pub fn proxy(&self) -> Arc<DeviceProxy> {
        self.proxy
            .lock()
            .clone()
            .expect("device proxy is not bound")
    }

    fn record(&self, event: ListenerEvent) -> Result<(), ListenerError> {
        self.events
            .send(event)
            .map_err(|_| ListenerError::msg("test dropped the event receiver"))
    }
}

#[async_trait]
impl DeviceListener for RecordingListener {
    fn identity(&self) -> &Identity {
        &self.identity
    }

    fn bind_device_proxy(&self, proxy: Arc<DeviceProxy>) {
        self.binds.fetch_add(1, Ordering::SeqCst);
        *self.proxy.lock() = Some(proxy);
    }

    async fn process_device_message_batch(
        &self,
        messages: Vec<InternalMessage>,
    ) -> Result<(), ListenerError> {
        self.record(ListenerEvent::Batch(messages))
    }

    async fn process_message_feedback(
        &self,
        lock_token: String,
        status: FeedbackStatus,
    ) -> Result<(), ListenerError> {
        self.record(ListenerEvent::Feedback(lock_token, status))
    }

    async fn add_desired_property_updates_subscription(
        &self,
        correlation_id: String,
    ) -> Result<(), ListenerError> {
        self.record(ListenerEvent::Subscribe(correlation_id))
    }

    async fn remove_desired_property_updates_subscription(
        &self,
        correlation_id: String,
    ) -> Result<(), ListenerError> {
        self.record(ListenerEvent::Unsubscribe(correlation_id))
    }

    async fn send_get_twin_request(&self, correlation_id: String) -> Result<(), ListenerError> {
        self.record(ListenerEvent::GetTwin(correlation_id))
    }

    async fn update_reported_properties(
        &self,
        reported_properties: InternalMessage,
        correlation_id: String,
    ) -> Result<(), ListenerError> {
        self.record(ListenerEvent::ReportedProperties(
            reported_properties,
            correlation_id,
        ))
    }

    async fn process_method_response(
        &self,
        response: DirectMethodResponse,
    ) -> Result<(), ListenerError> {
        self.record(ListenerEvent::MethodResponse(response))
    }
}

/// Hands out one [`RecordingListener`] per call, after an optional delay
pub struct CountingProvider {
    pub calls: AtomicUsize,
    delay: Duration,
    listeners: Mutex<Vec<Arc<RecordingListener>>>,
    events: mpsc::UnboundedSender<ListenerEvent>,
}

impl CountingProvider {
    pub fn new(delay: Duration) -> (Arc<Self>, mpsc::UnboundedReceiver<ListenerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let provider = Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay,
            listeners: Mutex::new(Vec::new()),
            events,
        });
        (provider, rx)
    }

    pub fn listeners(&self) -> Vec<Arc<RecordingListener>> {
        self.listeners.lock().clone()
    }

    pub fn listener(&self) -> Arc<RecordingListener> {
        self.listeners
            .lock()
            .first()
            .cloned()
            .expect("no listener was created")
    }
}

#[async_trait]
impl ConnectionProvider for CountingProvider {
    async fn get_device_listener(
        &self,
        identity: Identity,
    ) -> Result<Arc<dyn DeviceListener>, ListenerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let listener = Arc::new(RecordingListener {
            identity,
            proxy: Mutex::new(None),
            binds: AtomicUsize::new(0),
            events: self.events.clone(),
        });
        self.listeners.lock().push(listener.clone());
        Ok(listener)
    }
}

pub struct StaticAuthenticator(pub bool);

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn authenticate(&self, _: &ClientCredentials) -> Result<bool, ListenerError> {
        Ok(self.0)
    }
}

/// Context of a connection that authenticates through `$cbs`
pub fn cbs_context(
    provider: Arc<CountingProvider>,
    accept: bool,
    max_message_size: u64,
) -> Arc<ConnectionContext> {
    Arc::new(ConnectionContext::new(
        HUB,
        None,
        max_message_size,
        provider,
        Arc::new(StaticAuthenticator(accept)),
        Arc::new(IdentityCredentialsFactory),
    ))
}

/// Context of a connection that authenticated with SASL PLAIN as `username`
pub fn sasl_context(provider: Arc<CountingProvider>, username: &str) -> Arc<ConnectionContext> {
    let principal = SaslPrincipal {
        identity: SaslIdentity::parse(username).expect("valid SASL username"),
        password: "SharedAccessSignature sr=hub".into(),
    };
    Arc::new(ConnectionContext::new(
        HUB,
        Some(principal),
        256 * 1024,
        provider,
        Arc::new(StaticAuthenticator(true)),
        Arc::new(IdentityCredentialsFactory),
    ))
}

/// Settlement of a transfer on a [`ChannelReceivingLink`]
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    Accepted(u64),
    Rejected(u64, Option<definitions::Error>),
}

/// Error the link was closed with, `Some(None)` once closed without error
pub type ClosedSlot = Arc<Mutex<Option<Option<definitions::Error>>>>;

pub struct ChannelReceivingLink {
    name: String,
    transfers: mpsc::UnboundedReceiver<IncomingTransfer>,
    settlements: mpsc::UnboundedSender<Settlement>,
    closed: ClosedSlot,
}

/// Test side of a [`ChannelReceivingLink`]
pub struct PeerSender {
    pub transfers: mpsc::UnboundedSender<IncomingTransfer>,
    pub settlements: mpsc::UnboundedReceiver<Settlement>,
    pub closed: ClosedSlot,
    next_id: u64,
}

impl PeerSender {
    /// Sends a message and waits for its settlement
    pub async fn send(&mut self, message: AmqpMessage) -> Settlement {
        self.send_sized(message, 32).await
    }

    pub async fn send_sized(&mut self, message: AmqpMessage, size: usize) -> Settlement {
        let id = self.next_id;
        self.next_id += 1;
        self.transfers
            .send(IncomingTransfer {
                id,
                message,
                message_format: 0,
                size,
            })
            .expect("receiving link is gone");
        tokio::time::timeout(TIMEOUT, self.settlements.recv())
            .await
            .expect("settlement timed out")
            .expect("receiving link is gone")
    }

    pub fn closed_with(&self) -> Option<Option<definitions::Error>> {
        self.closed.lock().clone()
    }
}

pub fn receiving_link(name: &str) -> (Box<dyn ReceivingLink>, PeerSender) {
    let (transfers_tx, transfers_rx) = mpsc::unbounded_channel();
    let (settlements_tx, settlements_rx) = mpsc::unbounded_channel();
    let closed = ClosedSlot::default();
    let link = ChannelReceivingLink {
        name: name.to_string(),
        transfers: transfers_rx,
        settlements: settlements_tx,
        closed: closed.clone(),
    };
    let peer = PeerSender {
        transfers: transfers_tx,
        settlements: settlements_rx,
        closed,
        next_id: 0,
    };
    (Box::new(link), peer)
}

#[async_trait]
impl ReceivingLink for ChannelReceivingLink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn recv(&mut self) -> Result<Option<IncomingTransfer>, LinkError> {
        Ok(self.transfers.recv().await)
    }

    async fn accept(&mut self, id: u64) -> Result<(), LinkError> {
        self.settlements
            .send(Settlement::Accepted(id))
            .map_err(|_| LinkError::Detached)
    }

    async fn reject(&mut self, id: u64, error: Option<definitions::Error>) -> Result<(), LinkError> {
        self.settlements
            .send(Settlement::Rejected(id, error))
            .map_err(|_| LinkError::Detached)
    }

    async fn close(self: Box<Self>, error: Option<definitions::Error>) -> Result<(), LinkError> {
        *self.closed.lock() = Some(error);
        Ok(())
    }
}

pub struct ChannelSendingLink {
    name: String,
    outcome: DeliveryOutcome,
    sent: mpsc::UnboundedSender<OutgoingTransfer>,
    closed: ClosedSlot,
}

/// Test side of a [`ChannelSendingLink`]
pub struct PeerReceiver {
    pub sent: mpsc::UnboundedReceiver<OutgoingTransfer>,
    pub closed: ClosedSlot,
}

impl PeerReceiver {
    pub async fn recv(&mut self) -> OutgoingTransfer {
        tokio::time::timeout(TIMEOUT, self.sent.recv())
            .await
            .expect("no transfer was sent")
            .expect("sending link is gone")
    }

    pub fn closed_with(&self) -> Option<Option<definitions::Error>> {
        self.closed.lock().clone()
    }
}

/// A sending link whose peer settles every unsettled delivery with `outcome`
pub fn sending_link(name: &str, outcome: DeliveryOutcome) -> (Box<dyn SendingLink>, PeerReceiver) {
    let (sent_tx, sent_rx) = mpsc::unbounded_channel();
    let closed = ClosedSlot::default();
    let link = ChannelSendingLink {
        name: name.to_string(),
        outcome,
        sent: sent_tx,
        closed: closed.clone(),
    };
    (
        Box::new(link),
        PeerReceiver {
            sent: sent_rx,
            closed,
        },
    )
}

#[async_trait]
impl SendingLink for ChannelSendingLink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(
        &mut self,
        transfer: OutgoingTransfer,
    ) -> Result<Option<DeliveryOutcome>, LinkError> {
        let settled = transfer.settled;
        self.sent.send(transfer).map_err(|_| LinkError::Detached)?;
        Ok(if settled { None } else { Some(self.outcome) })
    }

    async fn close(self: Box<Self>, error: Option<definitions::Error>) -> Result<(), LinkError> {
        *self.closed.lock() = Some(error);
        Ok(())
    }
}

/// A message with a string value body
pub fn text_message(text: &str) -> AmqpMessage {
    Message {
        header: None,
        delivery_annotations: None,
        message_annotations: None,
        properties: None,
        application_properties: None,
        body: Body::Value(AmqpValue(Value::String(text.to_string()))),
        footer: None,
    }
}

/// Sets the correlation id of a message
pub fn with_correlation_id(mut message: AmqpMessage, correlation_id: &str) -> AmqpMessage {
    let mut properties = message.properties.take().unwrap_or_default();
    properties.correlation_id = Some(correlation_id.to_string().into());
    message.properties = Some(properties);
    message
}

/// Sets the message id of a message
pub fn with_message_id(mut message: AmqpMessage, message_id: &str) -> AmqpMessage {
    let mut properties: Properties = message.properties.take().unwrap_or_default();
    properties.message_id = Some(message_id.to_string().into());
    message.properties = Some(properties);
    message
}

/// Waits for the next listener event
pub async fn next_event(events: &mut mpsc::UnboundedReceiver<ListenerEvent>) -> ListenerEvent {
    tokio::time::timeout(TIMEOUT, events.recv())
        .await
        .expect("no listener event")
        .expect("listener events closed")
}
