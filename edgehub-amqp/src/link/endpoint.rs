//! Link seams between the link handlers and the AMQP engine

use std::collections::HashMap;

use async_trait::async_trait;
use fe2o3_amqp::{
    link::{Receiver, Sender},
    types::messaging::{message::__private::Serializable, Outcome},
    Delivery, Sendable,
};
use fe2o3_amqp_types::{definitions, messaging::Body, primitives::Value};
use tracing::trace;

use crate::{constants::DEFAULT_MESSAGE_FORMAT, error::LinkError, message::AmqpMessage};

/// A transfer received on a receiving link
#[derive(Debug)]
pub struct IncomingTransfer {
    /// Link local id used to settle the transfer
    pub id: u64,
    pub message: AmqpMessage,
    pub message_format: u32,

    /// Encoded size of the message
    pub size: usize,
}

/// A transfer to send on a sending link
#[derive(Debug)]
pub struct OutgoingTransfer {
    /// Tag derived from the lock token of the message.
    ///
    /// [`Fe2o3SendingLink`] does not put it on the wire because fe2o3-amqp assigns its own
    /// delivery tags. Feedback is correlated through the lock-token message annotation.
    pub delivery_tag: Vec<u8>,
    pub message: AmqpMessage,
    pub settled: bool,
}

/// Terminal outcome of an unsettled delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Accepted,
    Rejected,
    Released,
    Modified,
}

/// Receiving end of an attached link (the peer sends, we receive)
#[async_trait]
pub trait ReceivingLink: Send {
    fn name(&self) -> &str;

    /// Waits for the next transfer. `None` once the peer detached the link.
    async fn recv(&mut self) -> Result<Option<IncomingTransfer>, LinkError>;

    async fn accept(&mut self, id: u64) -> Result<(), LinkError>;

    async fn reject(&mut self, id: u64, error: Option<definitions::Error>) -> Result<(), LinkError>;

    async fn close(self: Box<Self>, error: Option<definitions::Error>) -> Result<(), LinkError>;
}

/// Sending end of an attached link (we send, the peer receives)
#[async_trait]
pub trait SendingLink: Send {
    fn name(&self) -> &str;

    /// Sends a transfer. Returns the outcome of unsettled transfers, `None` for settled ones.
    async fn send(&mut self, transfer: OutgoingTransfer)
        -> Result<Option<DeliveryOutcome>, LinkError>;

    async fn close(self: Box<Self>, error: Option<definitions::Error>) -> Result<(), LinkError>;
}

/// [`ReceivingLink`] over a fe2o3-amqp [`Receiver`]
pub struct Fe2o3ReceivingLink {
    name: String,
    inner: Receiver,
    next_id: u64,
    unsettled: HashMap<u64, Delivery<Body<Value>>>,
}

impl std::fmt::Debug for Fe2o3ReceivingLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fe2o3ReceivingLink")
            .field("name", &self.name)
            .field("unsettled", &self.unsettled.len())
            .finish()
    }
}

impl Fe2o3ReceivingLink {
    pub fn new(name: impl Into<String>, inner: Receiver) -> Self {
        Self {
            name: name.into(),
            inner,
            next_id: 0,
            unsettled: HashMap::new(),
        }
    }

    fn take(&mut self, id: u64) -> Result<Delivery<Body<Value>>, LinkError> {
        self.unsettled
            .remove(&id)
            .ok_or(LinkError::IllegalState(super::LinkState::Active))
    }
}

#[async_trait]
impl ReceivingLink for Fe2o3ReceivingLink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn recv(&mut self) -> Result<Option<IncomingTransfer>, LinkError> {
        let delivery = self.inner.recv::<Body<Value>>().await?;
        let message_format = delivery
            .message_format()
            .unwrap_or(DEFAULT_MESSAGE_FORMAT);
        let message = delivery.message().clone();
        let size = serde_amqp::to_vec(&Serializable(message.clone()))
            .map(|buf| buf.len())
            .unwrap_or_default();

        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.unsettled.insert(id, delivery);
        trace!(link = %self.name, id, size, "Received transfer");

        Ok(Some(IncomingTransfer {
            id,
            message,
            message_format,
            size,
        }))
    }

    async fn accept(&mut self, id: u64) -> Result<(), LinkError> {
        let delivery = self.take(id)?;
        self.inner.accept(&delivery).await?;
        Ok(())
    }

    async fn reject(&mut self, id: u64, error: Option<definitions::Error>) -> Result<(), LinkError> {
        let delivery = self.take(id)?;
        self.inner.reject(&delivery, error).await?;
        Ok(())
    }

    async fn close(self: Box<Self>, error: Option<definitions::Error>) -> Result<(), LinkError> {
        let this = *self;
        match error {
            Some(error) => this.inner.close_with_error(error).await?,
            None => this.inner.close().await?,
        }
        Ok(())
    }
}

/// [`SendingLink`] over a fe2o3-amqp [`Sender`]
pub struct Fe2o3SendingLink {
    name: String,
    inner: Sender,
}

impl std::fmt::Debug for Fe2o3SendingLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fe2o3SendingLink")
            .field("name", &self.name)
            .finish()
    }
}

impl Fe2o3SendingLink {
    pub fn new(name: impl Into<String>, inner: Sender) -> Self {
        Self {
            name: name.into(),
            inner,
        }
    }
}

#[async_trait]
impl SendingLink for Fe2o3SendingLink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(
        &mut self,
        transfer: OutgoingTransfer,
    ) -> Result<Option<DeliveryOutcome>, LinkError> {
        trace!(
            link = %self.name,
            tag = ?transfer.delivery_tag,
            settled = transfer.settled,
            "Sending transfer"
        );
        let sendable = Sendable::builder()
            .message(transfer.message)
            .settled(transfer.settled)
            .build();
        let outcome = self.inner.send(sendable).await?;
        if transfer.settled {
            return Ok(None);
        }

        #[allow(unreachable_patterns)]
        let outcome = match outcome {
            Outcome::Accepted(_) => Some(DeliveryOutcome::Accepted),
            Outcome::Rejected(_) => Some(DeliveryOutcome::Rejected),
            Outcome::Released(_) => Some(DeliveryOutcome::Released),
            Outcome::Modified(_) => Some(DeliveryOutcome::Modified),
            _ => None,
        };
        Ok(outcome)
    }

    async fn close(self: Box<Self>, error: Option<definitions::Error>) -> Result<(), LinkError> {
        let this = *self;
        match error {
            Some(error) => this.inner.close_with_error(error).await?,
            None => this.inner.close().await?,
        }
        Ok(())
    }
}

/// A link attached by the peer, before it is bound to a handler
pub enum AttachedLink {
    Receiving(Box<dyn ReceivingLink>),
    Sending(Box<dyn SendingLink>),
}

impl AttachedLink {
    pub fn name(&self) -> &str {
        match self {
            AttachedLink::Receiving(link) => link.name(),
            AttachedLink::Sending(link) => link.name(),
        }
    }

    pub fn direction(&self) -> super::LinkDirection {
        match self {
            AttachedLink::Receiving(_) => super::LinkDirection::Receiving,
            AttachedLink::Sending(_) => super::LinkDirection::Sending,
        }
    }

    /// Detaches the link, closing it
    pub async fn close(self, error: Option<definitions::Error>) -> Result<(), LinkError> {
        match self {
            AttachedLink::Receiving(link) => link.close(error).await,
            AttachedLink::Sending(link) => link.close(error).await,
        }
    }
}

impl std::fmt::Debug for AttachedLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachedLink")
            .field("name", &self.name())
            .field("direction", &self.direction())
            .finish()
    }
}
