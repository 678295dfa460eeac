//! Direct method requests and responses

use std::time::Duration;

use bytes::Bytes;
use fe2o3_amqp_types::{
    messaging::{ApplicationProperties, Body, Data, Message, MessageId, Properties},
    primitives::{Binary, SimpleValue},
};

use crate::{
    constants::{METHOD_NAME, METHOD_STATUS},
    error::ConversionError,
};

use super::{
    converter::{message_id_to_string, simple_value_to_string},
    AmqpMessage,
};

/// Default time a method invocation waits for the device to respond
pub const DEFAULT_METHOD_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Method invocation sent to a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectMethodRequest {
    pub correlation_id: String,
    pub name: String,
    pub data: Bytes,
    pub response_timeout: Duration,
}

impl DirectMethodRequest {
    pub fn new(correlation_id: impl Into<String>, name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            name: name.into(),
            data: data.into(),
            response_timeout: DEFAULT_METHOD_RESPONSE_TIMEOUT,
        }
    }
}

/// Response of a device to a [`DirectMethodRequest`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectMethodResponse {
    pub correlation_id: String,
    pub status: i32,
    pub data: Bytes,
}

/// Converts method requests to wire messages and wire messages to method responses
#[derive(Debug, Default, Clone, Copy)]
pub struct MethodMessageConverter;

impl MethodMessageConverter {
    pub fn new() -> Self {
        Self
    }

    pub fn from_request(&self, request: &DirectMethodRequest) -> AmqpMessage {
        let mut properties = Properties::default();
        properties.correlation_id = Some(MessageId::String(request.correlation_id.clone()));
        let application_properties = ApplicationProperties::builder()
            .insert(METHOD_NAME.to_string(), SimpleValue::String(request.name.clone()))
            .build();

        Message {
            header: None,
            delivery_annotations: None,
            message_annotations: None,
            properties: Some(properties),
            application_properties: Some(application_properties),
            body: Body::from(Data(Binary::from(request.data.to_vec()))),
            footer: None,
        }
    }

    pub fn to_response(&self, message: AmqpMessage) -> Result<DirectMethodResponse, ConversionError> {
        let correlation_id = message
            .properties
            .as_ref()
            .and_then(|p| p.correlation_id.as_ref())
            .map(message_id_to_string)
            .ok_or(ConversionError::MissingProperty("correlation-id"))?;

        let status = message
            .application_properties
            .as_ref()
            .and_then(|ap| {
                ap.iter()
                    .find(|(key, _)| key.as_str() == METHOD_STATUS)
                    .map(|(_, value)| value)
            })
            .ok_or(ConversionError::MissingProperty(METHOD_STATUS))?;
        let status = simple_value_to_string(status)
            .and_then(|s| s.parse::<i32>().ok())
            .ok_or(ConversionError::InvalidType(METHOD_STATUS))?;

        let data = match message.body.try_into_data() {
            Ok(sections) => sections.flat_map(|b| b.into_vec()).collect::<Vec<u8>>().into(),
            Err(Body::Empty) => Bytes::new(),
            Err(_) => return Err(ConversionError::UnsupportedBody),
        };

        Ok(DirectMethodResponse {
            correlation_id,
            status,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_carries_name_and_correlation_id() {
        let converter = MethodMessageConverter::new();
        let request = DirectMethodRequest::new("corr-1", "reboot", &b"{}"[..]);
        let message = converter.from_request(&request);

        let properties = message.properties.as_ref().unwrap();
        assert_eq!(
            properties.correlation_id,
            Some(MessageId::String("corr-1".into()))
        );
        let name = message
            .application_properties
            .as_ref()
            .unwrap()
            .iter()
            .find(|(k, _)| k.as_str() == METHOD_NAME)
            .map(|(_, v)| v.clone());
        assert_eq!(name, Some(SimpleValue::String("reboot".into())));
    }

    fn response_message(status: Option<SimpleValue>, correlation_id: Option<&str>) -> AmqpMessage {
        let mut properties = Properties::default();
        properties.correlation_id = correlation_id.map(|id| MessageId::String(id.into()));
        let mut builder = ApplicationProperties::builder();
        if let Some(status) = status {
            builder = builder.insert(METHOD_STATUS.to_string(), status);
        }
        Message {
            header: None,
            delivery_annotations: None,
            message_annotations: None,
            properties: Some(properties),
            application_properties: Some(builder.build()),
            body: Body::from(Data(Binary::from(b"result".to_vec()))),
            footer: None,
        }
    }

    #[test]
    fn response_is_parsed() {
        let converter = MethodMessageConverter::new();
        let response = converter
            .to_response(response_message(Some(SimpleValue::Int(200)), Some("corr-1")))
            .unwrap();
        assert_eq!(response.correlation_id, "corr-1");
        assert_eq!(response.status, 200);
        assert_eq!(&response.data[..], b"result");
    }

    #[test]
    fn response_without_status_is_rejected() {
        let converter = MethodMessageConverter::new();
        let err = converter
            .to_response(response_message(None, Some("corr-1")))
            .unwrap_err();
        assert!(matches!(err, ConversionError::MissingProperty(METHOD_STATUS)));

        let err = converter
            .to_response(response_message(Some(SimpleValue::Int(200)), None))
            .unwrap_err();
        assert!(matches!(err, ConversionError::MissingProperty("correlation-id")));
    }
}
