//! Broker side message model and its conversion to and from AMQP messages

use std::collections::BTreeMap;

use bytes::Bytes;

pub mod converter;
pub mod method;

pub use converter::AmqpMessageConverter;
pub use method::{DirectMethodRequest, DirectMethodResponse, MethodMessageConverter};

/// Wire message type handled by the links
pub type AmqpMessage = fe2o3_amqp_types::messaging::Message<
    fe2o3_amqp_types::messaging::Body<fe2o3_amqp_types::primitives::Value>,
>;

/// System properties of an [`InternalMessage`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SystemProperty {
    MessageId,
    CorrelationId,
    ContentType,
    ContentEncoding,
    To,
    UserId,
    ExpiryTimeUtc,
    EnqueuedTime,
    DeliveryCount,
    LockToken,
    SequenceNumber,
    MessageSchema,
    CreationTime,
    Operation,
    InputName,
    OutputName,
    ConnectionDeviceId,
    ConnectionModuleId,
}

/// Message as seen by the device listener
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InternalMessage {
    pub body: Bytes,
    pub system_properties: BTreeMap<SystemProperty, String>,
    pub properties: BTreeMap<String, String>,
}

impl InternalMessage {
    /// Creates a message with the given body and no properties
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            ..Default::default()
        }
    }

    /// Sets a system property
    pub fn with_system_property(mut self, key: SystemProperty, value: impl Into<String>) -> Self {
        self.system_properties.insert(key, value.into());
        self
    }

    /// Sets a free-form property
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn system_property(&self, key: SystemProperty) -> Option<&str> {
        self.system_properties.get(&key).map(String::as_str)
    }

    pub fn lock_token(&self) -> Option<&str> {
        self.system_property(SystemProperty::LockToken)
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.system_property(SystemProperty::CorrelationId)
    }
}

/// Broker side interpretation of a delivery outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedbackStatus {
    Complete,
    Reject,
    Abandon,
}
