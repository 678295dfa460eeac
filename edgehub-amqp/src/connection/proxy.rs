//! Capability registry the device listener uses to reach the device

use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::{
    error::LinkError,
    link::{OutboundMessage, OutboundSender},
    message::{DirectMethodRequest, DirectMethodResponse, InternalMessage, SystemProperty},
};

/// What a sending link registered on the proxy can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceCapability {
    C2DMessages,
    ModuleMessages,
    MethodInvoker,
    DesiredPropertyUpdates,
    TwinResponses,
}

/// Routes messages from the broker to the sending links of one connection.
///
/// Each capability has a single slot. Registering replaces the previous sender, deregistering
/// only clears the slot if it still belongs to the same link.
#[derive(Default)]
pub struct DeviceProxy {
    senders: Mutex<HashMap<DeviceCapability, Arc<dyn OutboundSender>>>,
    pending_calls: Mutex<HashMap<String, oneshot::Sender<DirectMethodResponse>>>,
}

impl std::fmt::Debug for DeviceProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let capabilities: Vec<DeviceCapability> = self.senders.lock().keys().copied().collect();
        f.debug_struct("DeviceProxy")
            .field("capabilities", &capabilities)
            .field("pending_calls", &self.pending_calls.lock().len())
            .finish()
    }
}

impl DeviceProxy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, capability: DeviceCapability, sender: Arc<dyn OutboundSender>) {
        debug!(?capability, link = sender.link_name(), "Registering sender");
        if let Some(previous) = self.senders.lock().insert(capability, sender) {
            trace!(?capability, link = previous.link_name(), "Replaced sender");
        }
    }

    /// Removes the sender of `capability` if it was registered by `link_name`
    pub fn deregister(&self, capability: DeviceCapability, link_name: &str) {
        let mut senders = self.senders.lock();
        let owned = senders
            .get(&capability)
            .map(|sender| sender.link_name() == link_name)
            .unwrap_or(false);
        if owned {
            senders.remove(&capability);
            debug!(?capability, link = link_name, "Deregistered sender");
        }
    }

    pub fn is_registered(&self, capability: DeviceCapability) -> bool {
        self.senders.lock().contains_key(&capability)
    }

    fn sender(&self, capability: DeviceCapability) -> Result<Arc<dyn OutboundSender>, LinkError> {
        self.senders
            .lock()
            .get(&capability)
            .cloned()
            .ok_or(LinkError::CapabilityNotRegistered(capability))
    }

    /// Sends a cloud to device message
    pub async fn send_c2d_message(&self, message: InternalMessage) -> Result<(), LinkError> {
        self.sender(DeviceCapability::C2DMessages)?
            .send(OutboundMessage::Device(message))
            .await
    }

    /// Sends a message to the module input `input_name`
    pub async fn send_message(
        &self,
        message: InternalMessage,
        input_name: &str,
    ) -> Result<(), LinkError> {
        let message = message.with_system_property(SystemProperty::InputName, input_name);
        self.sender(DeviceCapability::ModuleMessages)?
            .send(OutboundMessage::Device(message))
            .await
    }

    /// Invokes a direct method and waits for the device to respond, up to the response
    /// timeout of the request
    pub async fn invoke_method(
        &self,
        request: DirectMethodRequest,
    ) -> Result<DirectMethodResponse, LinkError> {
        let sender = self.sender(DeviceCapability::MethodInvoker)?;
        let correlation_id = request.correlation_id.clone();
        let timeout = request.response_timeout;

        let (tx, rx) = oneshot::channel();
        self.pending_calls.lock().insert(correlation_id.clone(), tx);

        if let Err(err) = sender.send(OutboundMessage::MethodRequest(request)).await {
            self.pending_calls.lock().remove(&correlation_id);
            return Err(err);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(LinkError::Detached),
            Err(_) => {
                warn!(%correlation_id, "Direct method call timed out");
                self.pending_calls.lock().remove(&correlation_id);
                Err(LinkError::Timeout)
            }
        }
    }

    /// Completes a pending method call. The response is handed back when no call is pending
    /// for its correlation id.
    pub fn complete_method_call(
        &self,
        response: DirectMethodResponse,
    ) -> Option<DirectMethodResponse> {
        let pending = self.pending_calls.lock().remove(&response.correlation_id);
        match pending {
            Some(tx) => tx.send(response).err(),
            None => Some(response),
        }
    }

    /// Sends a desired property update
    pub async fn on_desired_property_updates(
        &self,
        message: InternalMessage,
    ) -> Result<(), LinkError> {
        self.sender(DeviceCapability::DesiredPropertyUpdates)?
            .send(OutboundMessage::Device(message))
            .await
    }

    /// Sends the response of a twin request
    pub async fn send_twin_update(&self, message: InternalMessage) -> Result<(), LinkError> {
        self.sender(DeviceCapability::TwinResponses)?
            .send(OutboundMessage::Device(message))
            .await
    }

    /// Drops every registration and pending call
    pub fn clear(&self) {
        self.senders.lock().clear();
        self.pending_calls.lock().clear();
    }
}
