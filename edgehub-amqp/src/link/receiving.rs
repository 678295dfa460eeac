//! Transfer processing of receiving links

use std::sync::Arc;

use fe2o3_amqp_types::{messaging::annotations::OwnedKey, primitives::Value};
use tracing::{debug, trace, warn};

use crate::{
    constants::{TWIN_DELETE, TWIN_GET, TWIN_OPERATION, TWIN_PATCH, TWIN_PUT},
    device::DeviceListener,
    error::{ConversionError, LinkError},
    message::{converter::message_id_to_string, AmqpMessage, SystemProperty},
};

use super::{IncomingTransfer, LinkHandler, LinkState, LinkType, ReceivingLink};

/// Processes transfers in arrival order until the peer detaches or the connection ends.
/// The link is handed back to the caller.
pub(super) async fn run_receiver(
    handler: &Arc<LinkHandler>,
    mut link: Box<dyn ReceivingLink>,
) -> (Box<dyn ReceivingLink>, Result<(), LinkError>) {
    handler.set_state(LinkState::Active);

    let result = loop {
        let transfer = tokio::select! {
            _ = handler.cancel.cancelled() => break Ok(()),
            transfer = link.recv() => transfer,
        };
        let transfer = match transfer {
            Ok(Some(transfer)) => transfer,
            Ok(None) => break Ok(()),
            Err(err) => {
                debug!(%err, "Receiving link ended");
                break Err(err);
            }
        };

        let id = transfer.id;
        let disposition = match handler.process_transfer(transfer).await {
            Ok(()) => link.accept(id).await,
            Err(err) => {
                warn!(%err, "Rejecting transfer");
                link.reject(id, Some(err.to_amqp_error())).await
            }
        };
        if let Err(err) = disposition {
            warn!(%err, id, "Failed to settle transfer");
        }
    };

    (link, result)
}

impl LinkHandler {
    pub(super) async fn process_transfer(
        &self,
        transfer: IncomingTransfer,
    ) -> Result<(), LinkError> {
        let max = self.context.max_message_size;
        if transfer.size as u64 > max {
            return Err(LinkError::MessageSizeExceeded {
                size: transfer.size,
                max,
            });
        }
        trace!(id = transfer.id, size = transfer.size, "Processing transfer");

        match self.link_type {
            LinkType::Cbs => {
                let cbs = &self.context.cbs;
                let response = cbs.handle_put_token_request(&transfer.message).await;
                cbs.send_response(response).await
            }
            LinkType::Events => self.process_events(transfer).await,
            LinkType::MethodResponse => self.process_method_response(transfer.message).await,
            LinkType::TwinReceiving => self.process_twin_request(transfer.message).await,
            LinkType::DeviceBound
            | LinkType::ModuleMessages
            | LinkType::MethodInvoke
            | LinkType::TwinSending => Err(LinkError::IllegalState(self.state())),
        }
    }

    fn device_listener(&self) -> Result<Arc<dyn DeviceListener>, LinkError> {
        self.listener()
            .ok_or_else(|| LinkError::IllegalState(self.state()))
    }

    async fn process_events(&self, transfer: IncomingTransfer) -> Result<(), LinkError> {
        let mut messages = self
            .converter
            .to_messages(transfer.message, transfer.message_format)?;
        if let Some(identity) = self.identity() {
            for message in messages.iter_mut() {
                message
                    .system_properties
                    .insert(SystemProperty::ConnectionDeviceId, identity.device_id.clone());
                if let Some(module_id) = &identity.module_id {
                    message
                        .system_properties
                        .insert(SystemProperty::ConnectionModuleId, module_id.clone());
                }
            }
        }
        self.device_listener()?
            .process_device_message_batch(messages)
            .await?;
        Ok(())
    }

    async fn process_method_response(&self, message: AmqpMessage) -> Result<(), LinkError> {
        let response = self.method_converter.to_response(message)?;
        let unmatched = self
            .context
            .handler
            .device_proxy()
            .complete_method_call(response);
        if let Some(response) = unmatched {
            debug!(correlation_id = %response.correlation_id, "No pending call for method response");
            self.device_listener()?
                .process_method_response(response)
                .await?;
        }
        Ok(())
    }

    async fn process_twin_request(&self, message: AmqpMessage) -> Result<(), LinkError> {
        let operation = twin_operation(&message).unwrap_or_default();
        let correlation_id = message
            .properties
            .as_ref()
            .and_then(|p| p.correlation_id.as_ref())
            .map(message_id_to_string)
            .ok_or(ConversionError::MissingProperty("correlation-id"))?;
        let listener = self.device_listener()?;

        match operation.as_str() {
            TWIN_GET => listener.send_get_twin_request(correlation_id).await?,
            TWIN_PATCH => {
                let reported_properties = self.converter.to_message(message)?;
                listener
                    .update_reported_properties(reported_properties, correlation_id)
                    .await?
            }
            TWIN_PUT => {
                listener
                    .add_desired_property_updates_subscription(correlation_id)
                    .await?
            }
            TWIN_DELETE => {
                listener
                    .remove_desired_property_updates_subscription(correlation_id)
                    .await?
            }
            _ => return Err(LinkError::UnsupportedOperation(operation)),
        }
        Ok(())
    }
}

/// Value of the `operation` message annotation
fn twin_operation(message: &AmqpMessage) -> Option<String> {
    message
        .message_annotations
        .as_ref()?
        .iter()
        .find_map(|(key, value)| match (key, value) {
            (OwnedKey::Symbol(key), Value::String(op)) if key.as_str() == TWIN_OPERATION => {
                Some(op.clone())
            }
            (OwnedKey::Symbol(key), Value::Symbol(op)) if key.as_str() == TWIN_OPERATION => {
                Some(op.as_str().to_string())
            }
            _ => None,
        })
}
