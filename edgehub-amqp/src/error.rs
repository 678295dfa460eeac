//! Errors of the protocol head, its connections and links

use std::sync::Arc;

use fe2o3_amqp_types::definitions::{self, AmqpError, ErrorCondition};

use crate::link::{LinkDirection, LinkState};

/// Boxed error used at the boundary with external collaborators
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Opaque error returned by external collaborators (device listeners, connection providers,
/// authenticators)
#[derive(Debug, Clone, thiserror::Error)]
#[error(transparent)]
pub struct ListenerError(Arc<dyn std::error::Error + Send + Sync + 'static>);

impl ListenerError {
    /// Wraps any error
    pub fn new(err: impl Into<BoxError>) -> Self {
        Self(Arc::from(err.into()))
    }

    /// Creates an error from a message
    pub fn msg(msg: impl std::fmt::Display) -> Self {
        Self::new(msg.to_string())
    }
}

/// Error parsing the SASL PLAIN username
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SaslIdentityError {
    /// The username is empty or whitespace
    #[error("SASL identity must not be empty")]
    Empty,

    /// The username does not match any recognized shape
    #[error("Unrecognized SASL identity {0:?}")]
    Unrecognized(String),
}

/// Error converting between wire messages and internal messages
#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    /// AMQP sequence bodies carry no byte payload
    #[error("AmqpSequence body is not supported")]
    UnsupportedBody,

    /// A time property is not a valid RFC 3339 timestamp
    #[error("Invalid timestamp {0:?}")]
    InvalidTimestamp(String),

    /// A numeric system property is not a valid integer
    #[error("Invalid value {value:?} for {name}")]
    InvalidInteger {
        /// Name of the property
        name: &'static str,
        /// Offending value
        value: String,
    },

    /// A required property is absent
    #[error("Missing property {0}")]
    MissingProperty(&'static str),

    /// A property has an unexpected type
    #[error("Invalid type for property {0}")]
    InvalidType(&'static str),

    /// A batched data section could not be decoded
    #[error(transparent)]
    Decode(#[from] serde_amqp::Error),
}

/// Errors of the CBS node
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CbsError {
    /// The put-token request is malformed
    #[error("Invalid put-token request: {0}")]
    InvalidOperation(String),

    /// A CBS link of the same direction is already attached on this connection
    #[error("A {0} CBS link is already registered")]
    LinkAlreadyRegistered(LinkDirection),
}

/// Errors resolving the authentication or the device listener of a connection
#[derive(Debug, Clone, thiserror::Error)]
pub enum ResolveError {
    /// Authentication completed but was rejected
    #[error("Client is not authenticated")]
    Unauthenticated,

    /// Authentication succeeded without an identity
    #[error("Authentication did not produce an identity")]
    MissingIdentity,

    /// The CBS node was dropped before any put-token request arrived
    #[error("Connection closed before authentication")]
    Closed,

    /// An external collaborator failed
    #[error(transparent)]
    Listener(#[from] ListenerError),
}

/// Errors scoped to a single link
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// No template matches the link address
    #[error("No link handler for address {0:?}")]
    UnknownAddress(String),

    /// The link address is not a valid URI
    #[error("Invalid link address {0:?}")]
    InvalidAddress(String),

    /// Authentication does not hold for the client id of the link
    #[error("Link for {0} is not authorized")]
    Unauthorized(String),

    /// Opening the link exceeded its timeout
    #[error("Link open timed out")]
    Timeout,

    /// Operation not allowed in the current state
    #[error("Illegal link state {0:?}")]
    IllegalState(LinkState),

    /// The message exceeds the maximum message size of the link
    #[error("Message size {size} exceeds maximum {max}")]
    MessageSizeExceeded {
        /// Encoded size of the message
        size: usize,
        /// Maximum message size of the link
        max: u64,
    },

    /// The twin operation annotation is missing or unknown
    #[error("Unsupported operation {0:?}")]
    UnsupportedOperation(String),

    /// No sending link is registered for the capability
    #[error("No link registered for {0:?}")]
    CapabilityNotRegistered(crate::connection::DeviceCapability),

    /// The link was detached by the remote peer
    #[error("Link detached")]
    Detached,

    #[error(transparent)]
    Conversion(#[from] ConversionError),

    #[error(transparent)]
    Cbs(#[from] CbsError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error(transparent)]
    Recv(#[from] fe2o3_amqp::link::RecvError),

    #[error(transparent)]
    Send(#[from] fe2o3_amqp::link::SendError),

    #[error(transparent)]
    Disposition(#[from] fe2o3_amqp::link::DispositionError),

    #[error(transparent)]
    Detach(#[from] fe2o3_amqp::link::DetachError),
}

impl LinkError {
    /// The AMQP error carried by a detach or a rejected outcome
    pub fn to_amqp_error(&self) -> definitions::Error {
        let condition = match self {
            Self::UnknownAddress(_) => ErrorCondition::AmqpError(AmqpError::NotFound),
            Self::Unauthorized(_) | Self::Resolve(ResolveError::Unauthenticated) => {
                ErrorCondition::AmqpError(AmqpError::UnauthorizedAccess)
            }
            Self::MessageSizeExceeded { .. } => {
                ErrorCondition::LinkError(definitions::LinkError::MessageSizeExceeded)
            }
            Self::InvalidAddress(_)
            | Self::UnsupportedOperation(_)
            | Self::Conversion(_)
            | Self::Cbs(_) => ErrorCondition::AmqpError(AmqpError::InvalidField),
            Self::IllegalState(_) => ErrorCondition::AmqpError(AmqpError::IllegalState),
            _ => ErrorCondition::AmqpError(AmqpError::InternalError),
        };
        definitions::Error {
            condition,
            description: Some(self.to_string()),
            info: None,
        }
    }
}

/// Errors of a single AMQP connection
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// Connection creation failed
    #[error("Failed to create connection: {0}")]
    Create(String),

    /// Opening the connection exceeded its timeout
    #[error("Connection open timed out")]
    Timeout,

    /// The connection was used before it was opened
    #[error("Connection is not open")]
    NotOpen,

    /// Error raised by the AMQP engine
    #[error(transparent)]
    Engine(BoxError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors of the protocol head. Only listener setup errors are returned from
/// [`AmqpProtocolHead::start`](crate::head::AmqpProtocolHead::start).
#[derive(Debug, thiserror::Error)]
pub enum HeadError {
    /// A transport listener could not be created or opened
    #[error("Failed to start listener {address}: {source}")]
    Startup {
        /// Address of the listener
        address: String,
        /// Underlying error
        #[source]
        source: BoxError,
    },

    /// Start did not complete in time
    #[error("Protocol head start timed out")]
    Timeout,

    /// The head is already started
    #[error("Protocol head is already started")]
    AlreadyStarted,
}
