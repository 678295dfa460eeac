#![warn(missing_debug_implementations)]

//! AMQP 1.0 protocol head of an IoT edge hub.
//!
//! The head accepts AMQP connections from devices and modules, authenticates them with SASL
//! PLAIN or through the claims-based security node (`$cbs`), and maps every attached link to a
//! handler by its address. Handlers bridge the links to the broker side [`DeviceListener`] of
//! the authenticated identity.
//!
//! # Quick start
//!
//! ```rust,ignore
//! use edgehub_amqp::{
//!     auth::IdentityCredentialsFactory, head::AmqpProtocolHead, runtime::Fe2o3Runtime,
//!     settings::AmqpSettings, transport::TcpTransportListenerProvider,
//! };
//!
//! let settings = AmqpSettings::builder("myhub.azure-devices.net")
//!     .tcp("0.0.0.0:5672")
//!     .build();
//! let runtime = Fe2o3Runtime::new(
//!     settings.clone(),
//!     connection_provider,
//!     authenticator,
//!     Arc::new(IdentityCredentialsFactory),
//! );
//! let mut head = AmqpProtocolHead::new(settings, TcpTransportListenerProvider, runtime);
//! head.start().await?;
//! ```
//!
//! # Link addresses
//!
//! | Address | Direction | Link type |
//! |---|---|---|
//! | `$cbs` | both | [`LinkType::Cbs`](link::LinkType::Cbs) |
//! | `/devices/{deviceId}[/modules/{moduleId}]/messages/events` | receiving | telemetry |
//! | `/devices/{deviceId}/messages/deviceBound` | sending | cloud to device messages |
//! | `/devices/{deviceId}/modules/{moduleId}/messages/events` | sending | module messages |
//! | `/devices/{deviceId}[/modules/{moduleId}]/methods/deviceBound` | sending | method requests |
//! | `/devices/{deviceId}[/modules/{moduleId}]/methods/deviceBound` | receiving | method responses |
//! | `/devices/{deviceId}[/modules/{moduleId}]/twin` | both | twin requests and responses |

pub mod auth;
pub mod cbs;
pub mod connection;
pub mod constants;
pub mod device;
pub mod error;
pub mod head;
pub mod identity;
pub mod link;
pub mod message;
pub mod runtime;
pub mod sasl;
pub mod settings;
pub mod transport;
pub mod util;

pub use device::{ConnectionProvider, DeviceListener};
pub use head::AmqpProtocolHead;
pub use identity::{AmqpAuthentication, Identity};
pub use runtime::Fe2o3Runtime;
pub use settings::AmqpSettings;
