//! Conversion between AMQP messages and [`InternalMessage`]

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, SecondsFormat, Utc};
use fe2o3_amqp_types::{
    messaging::{
        annotations::OwnedKey, message::__private::Deserializable, AmqpValue,
        ApplicationProperties, Body, Data, Message, MessageAnnotations, MessageId, Properties,
    },
    primitives::{Binary, SimpleValue, Symbol, Timestamp, Value},
};

use crate::{
    constants::{
        BATCHED_MESSAGE_FORMAT, CONNECTION_DEVICE_ID, CONNECTION_MODULE_ID, CREATION_TIME,
        DELIVERY_COUNT, ENQUEUED_TIME, INPUT_NAME, IOTHUB_OPERATION, LOCK_TOKEN, MESSAGE_SCHEMA,
        OUTPUT_NAME, SEQUENCE_NUMBER,
    },
    error::ConversionError,
};

use super::{AmqpMessage, InternalMessage, SystemProperty};

/// Message annotations mapped to system properties
const ANNOTATION_PROPERTIES: [(&str, SystemProperty); 7] = [
    (ENQUEUED_TIME, SystemProperty::EnqueuedTime),
    (DELIVERY_COUNT, SystemProperty::DeliveryCount),
    (LOCK_TOKEN, SystemProperty::LockToken),
    (SEQUENCE_NUMBER, SystemProperty::SequenceNumber),
    (INPUT_NAME, SystemProperty::InputName),
    (CONNECTION_DEVICE_ID, SystemProperty::ConnectionDeviceId),
    (CONNECTION_MODULE_ID, SystemProperty::ConnectionModuleId),
];

/// Application properties mapped to system properties
const APPLICATION_PROPERTIES: [(&str, SystemProperty); 4] = [
    (MESSAGE_SCHEMA, SystemProperty::MessageSchema),
    (CREATION_TIME, SystemProperty::CreationTime),
    (IOTHUB_OPERATION, SystemProperty::Operation),
    (OUTPUT_NAME, SystemProperty::OutputName),
];

/// Converts wire messages to [`InternalMessage`]s and back
#[derive(Debug, Default, Clone, Copy)]
pub struct AmqpMessageConverter;

impl AmqpMessageConverter {
    /// Creates a new converter
    pub fn new() -> Self {
        Self
    }

    /// Converts a single wire message
    pub fn to_message(&self, message: AmqpMessage) -> Result<InternalMessage, ConversionError> {
        let mut internal = InternalMessage {
            body: body_to_bytes(message.body)?,
            ..Default::default()
        };

        if let Some(properties) = message.properties {
            read_properties(properties, &mut internal)?;
        }

        if let Some(annotations) = message.message_annotations {
            for (key, value) in annotations.iter() {
                let key = match key {
                    OwnedKey::Symbol(symbol) => symbol.as_str(),
                    _ => continue,
                };
                let property = ANNOTATION_PROPERTIES
                    .iter()
                    .find(|(name, _)| *name == key)
                    .map(|(_, property)| *property);
                if let (Some(property), Some(value)) = (property, value_to_string(value)) {
                    internal.system_properties.insert(property, value);
                }
            }
        }

        if let Some(application_properties) = message.application_properties {
            for (key, value) in application_properties.iter() {
                let value = match simple_value_to_string(value) {
                    Some(value) => value,
                    None => continue,
                };
                match APPLICATION_PROPERTIES
                    .iter()
                    .find(|(name, _)| *name == key.as_str())
                {
                    Some((_, property)) => {
                        internal.system_properties.insert(*property, value);
                    }
                    None => {
                        internal.properties.insert(key.clone(), value);
                    }
                }
            }
        }

        Ok(internal)
    }

    /// Converts a transfer that may be a batch. A transfer with the batched message format
    /// carries one encoded message per data section.
    pub fn to_messages(
        &self,
        message: AmqpMessage,
        message_format: u32,
    ) -> Result<Vec<InternalMessage>, ConversionError> {
        if message_format != BATCHED_MESSAGE_FORMAT {
            return self.to_message(message).map(|m| vec![m]);
        }

        let sections = message
            .body
            .try_into_data()
            .map_err(|_| ConversionError::UnsupportedBody)?;
        sections
            .map(|section| {
                let Deserializable(inner): Deserializable<AmqpMessage> =
                    serde_amqp::from_slice(&section)?;
                self.to_message(inner)
            })
            .collect()
    }

    /// Converts an internal message to its wire form
    pub fn from_message(&self, message: &InternalMessage) -> Result<AmqpMessage, ConversionError> {
        let mut properties = Properties::default();
        let mut has_properties = false;
        let mut annotations = MessageAnnotations::builder();
        let mut has_annotations = false;
        let mut application_properties = ApplicationProperties::builder();

        for (property, value) in &message.system_properties {
            let value = value.clone();
            match property {
                SystemProperty::MessageId => properties.message_id = Some(MessageId::from(value)),
                SystemProperty::CorrelationId => {
                    properties.correlation_id = Some(MessageId::from(value))
                }
                SystemProperty::ContentType => properties.content_type = Some(Symbol::from(value)),
                SystemProperty::ContentEncoding => {
                    properties.content_encoding = Some(Symbol::from(value))
                }
                SystemProperty::To => properties.to = Some(value),
                SystemProperty::UserId => properties.user_id = Some(Binary::from(value.into_bytes())),
                SystemProperty::ExpiryTimeUtc => {
                    properties.absolute_expiry_time = Some(parse_timestamp(&value)?)
                }
                SystemProperty::CreationTime => {
                    properties.creation_time = Some(parse_timestamp(&value)?)
                }
                SystemProperty::EnqueuedTime => {
                    annotations = annotations.insert(
                        Symbol::from(ENQUEUED_TIME),
                        Value::Timestamp(parse_timestamp(&value)?),
                    );
                    has_annotations = true;
                    continue;
                }
                SystemProperty::DeliveryCount => {
                    let count: u32 = parse_integer(DELIVERY_COUNT, &value)?;
                    annotations = annotations.insert(Symbol::from(DELIVERY_COUNT), Value::Uint(count));
                    has_annotations = true;
                    continue;
                }
                SystemProperty::SequenceNumber => {
                    let number: i64 = parse_integer(SEQUENCE_NUMBER, &value)?;
                    annotations =
                        annotations.insert(Symbol::from(SEQUENCE_NUMBER), Value::Long(number));
                    has_annotations = true;
                    continue;
                }
                SystemProperty::LockToken
                | SystemProperty::InputName
                | SystemProperty::ConnectionDeviceId
                | SystemProperty::ConnectionModuleId => {
                    if let Some((name, _)) = ANNOTATION_PROPERTIES
                        .iter()
                        .find(|(_, p)| p == property)
                    {
                        annotations = annotations.insert(Symbol::from(*name), Value::String(value));
                        has_annotations = true;
                    }
                    continue;
                }
                SystemProperty::MessageSchema
                | SystemProperty::Operation
                | SystemProperty::OutputName => {
                    if let Some((name, _)) = APPLICATION_PROPERTIES
                        .iter()
                        .find(|(_, p)| p == property)
                    {
                        application_properties =
                            application_properties.insert(name.to_string(), SimpleValue::String(value));
                    }
                    continue;
                }
            }
            has_properties = true;
        }

        let has_application_properties =
            !message.properties.is_empty() || message.system_properties.keys().any(|p| {
                matches!(
                    p,
                    SystemProperty::MessageSchema
                        | SystemProperty::Operation
                        | SystemProperty::OutputName
                )
            });
        for (key, value) in &message.properties {
            application_properties =
                application_properties.insert(key.clone(), SimpleValue::String(value.clone()));
        }

        Ok(Message {
            header: None,
            delivery_annotations: None,
            message_annotations: has_annotations.then(|| annotations.build()),
            properties: has_properties.then_some(properties),
            application_properties: has_application_properties
                .then(|| application_properties.build()),
            body: Body::from(Data(Binary::from(message.body.to_vec()))),
            footer: None,
        })
    }
}

fn body_to_bytes(body: Body<Value>) -> Result<Bytes, ConversionError> {
    match body {
        Body::Value(AmqpValue(value)) => match value {
            Value::String(s) => Ok(Bytes::from(s)),
            Value::Binary(b) => Ok(Bytes::from(b.into_vec())),
            Value::Null => Ok(Bytes::new()),
            _ => Err(ConversionError::InvalidType("body")),
        },
        Body::Sequence(_) => Err(ConversionError::UnsupportedBody),
        Body::Empty => Ok(Bytes::new()),
        body @ Body::Data(_) => {
            let sections = body
                .try_into_data()
                .map_err(|_| ConversionError::UnsupportedBody)?;
            let mut buf = BytesMut::new();
            for section in sections {
                buf.extend_from_slice(&section);
            }
            Ok(buf.freeze())
        }
    }
}

fn read_properties(
    properties: Properties,
    internal: &mut InternalMessage,
) -> Result<(), ConversionError> {
    let system = &mut internal.system_properties;
    if let Some(id) = properties.message_id {
        system.insert(SystemProperty::MessageId, message_id_to_string(&id));
    }
    if let Some(id) = properties.correlation_id {
        system.insert(SystemProperty::CorrelationId, message_id_to_string(&id));
    }
    if let Some(content_type) = properties.content_type {
        system.insert(SystemProperty::ContentType, content_type.as_str().to_string());
    }
    if let Some(content_encoding) = properties.content_encoding {
        system.insert(
            SystemProperty::ContentEncoding,
            content_encoding.as_str().to_string(),
        );
    }
    if let Some(to) = properties.to {
        system.insert(SystemProperty::To, to);
    }
    if let Some(user_id) = properties.user_id {
        system.insert(
            SystemProperty::UserId,
            String::from_utf8_lossy(&user_id).into_owned(),
        );
    }
    if let Some(expiry) = properties.absolute_expiry_time {
        system.insert(SystemProperty::ExpiryTimeUtc, format_timestamp(&expiry)?);
    }
    if let Some(creation_time) = properties.creation_time {
        system.insert(SystemProperty::CreationTime, format_timestamp(&creation_time)?);
    }
    Ok(())
}

pub(crate) fn message_id_to_string(id: &MessageId) -> String {
    match id {
        MessageId::Ulong(value) => value.to_string(),
        MessageId::Uuid(value) => uuid::Uuid::from_bytes(*value.as_inner()).to_string(),
        MessageId::Binary(value) => String::from_utf8_lossy(value).into_owned(),
        MessageId::String(value) => value.clone(),
    }
}

/// Formats a timestamp as RFC 3339 with milliseconds, in UTC
pub(crate) fn format_timestamp(timestamp: &Timestamp) -> Result<String, ConversionError> {
    DateTime::<Utc>::from_timestamp_millis(timestamp.milliseconds())
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        .ok_or_else(|| ConversionError::InvalidTimestamp(timestamp.milliseconds().to_string()))
}

pub(crate) fn parse_timestamp(value: &str) -> Result<Timestamp, ConversionError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| Timestamp::from_milliseconds(dt.timestamp_millis()))
        .map_err(|_| ConversionError::InvalidTimestamp(value.to_string()))
}

fn parse_integer<T: std::str::FromStr>(
    name: &'static str,
    value: &str,
) -> Result<T, ConversionError> {
    value.parse().map_err(|_| ConversionError::InvalidInteger {
        name,
        value: value.to_string(),
    })
}

fn value_to_string(value: &Value) -> Option<String> {
    let s = match value {
        Value::Bool(v) => v.to_string(),
        Value::Ubyte(v) => v.to_string(),
        Value::Ushort(v) => v.to_string(),
        Value::Uint(v) => v.to_string(),
        Value::Ulong(v) => v.to_string(),
        Value::Byte(v) => v.to_string(),
        Value::Short(v) => v.to_string(),
        Value::Int(v) => v.to_string(),
        Value::Long(v) => v.to_string(),
        Value::Float(v) => v.0.to_string(),
        Value::Double(v) => v.0.to_string(),
        Value::Char(v) => v.to_string(),
        Value::Timestamp(v) => format_timestamp(v).ok()?,
        Value::Uuid(v) => uuid::Uuid::from_bytes(*v.as_inner()).to_string(),
        Value::Binary(v) => String::from_utf8_lossy(v).into_owned(),
        Value::String(v) => v.clone(),
        Value::Symbol(v) => v.as_str().to_string(),
        _ => return None,
    };
    Some(s)
}

pub(crate) fn simple_value_to_string(value: &SimpleValue) -> Option<String> {
    let s = match value {
        SimpleValue::Bool(v) => v.to_string(),
        SimpleValue::Ubyte(v) => v.to_string(),
        SimpleValue::Ushort(v) => v.to_string(),
        SimpleValue::Uint(v) => v.to_string(),
        SimpleValue::Ulong(v) => v.to_string(),
        SimpleValue::Byte(v) => v.to_string(),
        SimpleValue::Short(v) => v.to_string(),
        SimpleValue::Int(v) => v.to_string(),
        SimpleValue::Long(v) => v.to_string(),
        SimpleValue::Float(v) => v.0.to_string(),
        SimpleValue::Double(v) => v.0.to_string(),
        SimpleValue::Char(v) => v.to_string(),
        SimpleValue::Timestamp(v) => format_timestamp(v).ok()?,
        SimpleValue::Uuid(v) => uuid::Uuid::from_bytes(*v.as_inner()).to_string(),
        SimpleValue::Binary(v) => String::from_utf8_lossy(v).into_owned(),
        SimpleValue::String(v) => v.clone(),
        SimpleValue::Symbol(v) => v.as_str().to_string(),
        _ => return None,
    };
    Some(s)
}
