//! Link handlers, their dispatch table and the link seams to the engine

use std::fmt;

use async_trait::async_trait;
use fe2o3_amqp_types::definitions::{ReceiverSettleMode, SenderSettleMode};

use crate::{
    error::LinkError,
    message::{AmqpMessage, DirectMethodRequest, InternalMessage},
};

pub mod endpoint;
pub mod handler;
pub mod provider;
mod receiving;
mod sending;
pub mod template;

pub use endpoint::{
    AttachedLink, DeliveryOutcome, Fe2o3ReceivingLink, Fe2o3SendingLink, IncomingTransfer,
    OutgoingTransfer, ReceivingLink, SendingLink,
};
pub use handler::LinkHandler;
pub use provider::LinkHandlerProvider;
pub use template::UriPathTemplate;

/// Direction of a link as seen from the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkDirection {
    /// The peer sends, the broker receives
    Receiving,

    /// The broker sends, the peer receives
    Sending,
}

impl fmt::Display for LinkDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkDirection::Receiving => write!(f, "receiving"),
            LinkDirection::Sending => write!(f, "sending"),
        }
    }
}

/// Purpose of a link, resolved from its address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkType {
    /// `$cbs` put-token requests (receiving) and responses (sending)
    Cbs,

    /// Telemetry from a device or module
    Events,

    /// Cloud to device messages
    DeviceBound,

    /// Messages routed to a module input
    ModuleMessages,

    /// Direct method requests to the device
    MethodInvoke,

    /// Direct method responses from the device
    MethodResponse,

    /// Twin requests from the device (GET, PATCH, PUT, DELETE)
    TwinReceiving,

    /// Twin responses and desired property updates to the device
    TwinSending,
}

impl LinkType {
    /// Direction of links of this type
    pub fn direction(&self) -> Option<LinkDirection> {
        match self {
            LinkType::Cbs => None,
            LinkType::Events | LinkType::MethodResponse | LinkType::TwinReceiving => {
                Some(LinkDirection::Receiving)
            }
            LinkType::DeviceBound
            | LinkType::ModuleMessages
            | LinkType::MethodInvoke
            | LinkType::TwinSending => Some(LinkDirection::Sending),
        }
    }

    pub fn qos(&self) -> QualityOfService {
        match self {
            LinkType::Events | LinkType::DeviceBound | LinkType::ModuleMessages => {
                QualityOfService::AtLeastOnce
            }
            LinkType::Cbs
            | LinkType::MethodInvoke
            | LinkType::MethodResponse
            | LinkType::TwinReceiving
            | LinkType::TwinSending => QualityOfService::AtMostOnce,
        }
    }
}

/// Delivery guarantee of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QualityOfService {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl QualityOfService {
    /// Sender and receiver settle modes negotiated for this QoS
    pub fn settle_modes(&self) -> (SenderSettleMode, ReceiverSettleMode) {
        match self {
            QualityOfService::AtMostOnce => (SenderSettleMode::Settled, ReceiverSettleMode::First),
            QualityOfService::AtLeastOnce => {
                (SenderSettleMode::Unsettled, ReceiverSettleMode::First)
            }
            QualityOfService::ExactlyOnce => {
                (SenderSettleMode::Unsettled, ReceiverSettleMode::Second)
            }
        }
    }

    /// Whether deliveries are sent pre-settled
    pub fn is_settled(&self) -> bool {
        matches!(self, QualityOfService::AtMostOnce)
    }
}

/// State of a [`LinkHandler`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    /// Constructed, not yet opened
    Attached,

    /// Authenticated and bound to the device listener
    Open,

    /// Processing transfers
    Active,

    /// Closed by either side
    Closed,
}

/// Messages pushed toward a device through a sending link
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    /// A device or module message, converted on the way out
    Device(InternalMessage),

    /// A direct method request
    MethodRequest(DirectMethodRequest),

    /// A wire message sent unchanged (CBS responses)
    Raw(AmqpMessage),
}

/// Something that can push messages toward a device
#[async_trait]
pub trait OutboundSender: Send + Sync {
    /// Name of the underlying link
    fn link_name(&self) -> &str;

    async fn send(&self, message: OutboundMessage) -> Result<(), LinkError>;
}
