//! Constants shared by the CBS node, the converters and the link handlers

/* -------------------------------------------------------------------------- */
/*                                     CBS                                    */
/* -------------------------------------------------------------------------- */

/// Address of the CBS node
pub const CBS_NODE_ADDR: &str = "$cbs";

/// Put token operation
pub const PUT_TOKEN: &str = "put-token";

/// Token type accepted by the CBS node
pub const SAS_TOKEN_TYPE: &str = "azure-devices.net:sastoken";

pub const OPERATION: &str = "operation";
pub const NAME: &str = "name";
pub const TYPE: &str = "type";

pub const STATUS_CODE: &str = "status-code";
pub const STATUS_DESCRIPTION: &str = "status-description";

/* -------------------------------------------------------------------------- */
/*                                  Messaging                                 */
/* -------------------------------------------------------------------------- */

/// Message format of a transfer whose data sections are each an encoded message
pub const BATCHED_MESSAGE_FORMAT: u32 = 0x8001_3700;

/// Default message format
pub const DEFAULT_MESSAGE_FORMAT: u32 = 0;

// Message annotations
pub const ENQUEUED_TIME: &str = "iothub-enqueuedtime";
pub const DELIVERY_COUNT: &str = "iothub-deliverycount";
pub const LOCK_TOKEN: &str = "x-opt-lock-token";
pub const SEQUENCE_NUMBER: &str = "x-opt-sequence-number";
pub const INPUT_NAME: &str = "x-opt-input-name";
pub const CONNECTION_DEVICE_ID: &str = "iothub-connection-device-id";
pub const CONNECTION_MODULE_ID: &str = "iothub-connection-module-id";

// Application properties
pub const MESSAGE_SCHEMA: &str = "iothub-message-schema";
pub const CREATION_TIME: &str = "iothub-creation-time-utc";
pub const IOTHUB_OPERATION: &str = "iothub-operation";
pub const OUTPUT_NAME: &str = "iothub-outputname";

/* -------------------------------------------------------------------------- */
/*                               Direct methods                               */
/* -------------------------------------------------------------------------- */

pub const METHOD_NAME: &str = "IoThub-methodname";
pub const METHOD_STATUS: &str = "IoThub-status";

/* -------------------------------------------------------------------------- */
/*                                    Twin                                    */
/* -------------------------------------------------------------------------- */

/// Message annotation carrying the twin operation
pub const TWIN_OPERATION: &str = "operation";

/// Message annotation carrying the status of a twin response
pub const TWIN_STATUS: &str = "status";

pub const TWIN_GET: &str = "GET";
pub const TWIN_PATCH: &str = "PATCH";
pub const TWIN_PUT: &str = "PUT";
pub const TWIN_DELETE: &str = "DELETE";
