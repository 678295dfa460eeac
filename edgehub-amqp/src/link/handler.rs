//! Link handler state machine

use std::{collections::HashMap, sync::Arc, time::Duration};

use fe2o3_amqp_types::definitions;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};
use url::Url;

use crate::{
    connection::{ConnectionContext, DeviceCapability},
    device::DeviceListener,
    error::LinkError,
    identity::Identity,
    message::{AmqpMessageConverter, MethodMessageConverter},
};

use super::{
    provider::ResolvedAddress, receiving, AttachedLink, LinkDirection, LinkState, LinkType,
    QualityOfService, ReceivingLink, SendingLink,
};

const DEVICE_ID: &str = "deviceId";
const MODULE_ID: &str = "moduleId";

/// Handler of a single attached link.
///
/// A handler is created per attach and lives as long as the link. It moves through
/// [`LinkState::Attached`], [`LinkState::Open`], [`LinkState::Active`] and finally
/// [`LinkState::Closed`].
pub struct LinkHandler {
    pub(super) name: String,
    request_uri: Url,
    bound_variables: HashMap<String, String>,
    pub(super) link_type: LinkType,
    direction: LinkDirection,

    /// Identity bound from the address. `None` for `$cbs` links.
    identity: Option<Identity>,

    pub(super) context: Arc<ConnectionContext>,
    pub(super) converter: AmqpMessageConverter,
    pub(super) method_converter: MethodMessageConverter,

    state: Mutex<LinkState>,
    pub(super) receiver: tokio::sync::Mutex<Option<Box<dyn ReceivingLink>>>,
    pub(super) sender: tokio::sync::Mutex<Option<Box<dyn SendingLink>>>,
    listener: Mutex<Option<Arc<dyn DeviceListener>>>,
    pub(super) cancel: CancellationToken,
}

impl std::fmt::Debug for LinkHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkHandler")
            .field("name", &self.name)
            .field("request_uri", &self.request_uri.as_str())
            .field("link_type", &self.link_type)
            .field("direction", &self.direction)
            .field("identity", &self.identity)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl LinkHandler {
    /// Checks that a resolved address carries what its link type needs
    pub(super) fn validate(resolved: &ResolvedAddress) -> Result<(), LinkError> {
        if resolved.link_type != LinkType::Cbs
            && !resolved.bound_variables.contains_key(DEVICE_ID)
        {
            return Err(LinkError::InvalidAddress(resolved.request_uri.to_string()));
        }
        Ok(())
    }

    pub(super) fn new(
        link: AttachedLink,
        resolved: ResolvedAddress,
        context: Arc<ConnectionContext>,
    ) -> Self {
        let ResolvedAddress {
            request_uri,
            link_type,
            bound_variables,
        } = resolved;

        let identity = match link_type {
            LinkType::Cbs => None,
            _ => bound_variables.get(DEVICE_ID).map(|device_id| Identity {
                iot_hub_host_name: context.iot_hub_host_name.clone(),
                device_id: device_id.clone(),
                module_id: bound_variables.get(MODULE_ID).cloned(),
            }),
        };

        let name = link.name().to_string();
        let direction = link.direction();
        let (receiver, sender) = match link {
            AttachedLink::Receiving(link) => (Some(link), None),
            AttachedLink::Sending(link) => (None, Some(link)),
        };

        Self {
            name,
            request_uri,
            bound_variables,
            link_type,
            direction,
            identity,
            cancel: context.shutdown.child_token(),
            context,
            converter: AmqpMessageConverter::new(),
            method_converter: MethodMessageConverter::new(),
            state: Mutex::new(LinkState::Attached),
            receiver: tokio::sync::Mutex::new(receiver),
            sender: tokio::sync::Mutex::new(sender),
            listener: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn request_uri(&self) -> &Url {
        &self.request_uri
    }

    pub fn bound_variables(&self) -> &HashMap<String, String> {
        &self.bound_variables
    }

    pub fn link_type(&self) -> LinkType {
        self.link_type
    }

    pub fn direction(&self) -> LinkDirection {
        self.direction
    }

    pub fn qos(&self) -> QualityOfService {
        self.link_type.qos()
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn state(&self) -> LinkState {
        *self.state.lock()
    }

    pub(super) fn set_state(&self, state: LinkState) {
        let mut guard = self.state.lock();
        trace!(link = %self.name, from = ?*guard, to = ?state, "Link state transition");
        *guard = state;
    }

    pub(super) fn listener(&self) -> Option<Arc<dyn DeviceListener>> {
        self.listener.lock().clone()
    }

    /// Authenticates the link, binds it to the device listener and registers what it can send.
    /// Exceeding `timeout` fails this link only.
    #[instrument(skip_all, fields(link = %self.name, link_type = ?self.link_type))]
    pub async fn open(self: &Arc<Self>, timeout: Duration) -> Result<(), LinkError> {
        let state = self.state();
        if state != LinkState::Attached {
            return Err(LinkError::IllegalState(state));
        }

        match tokio::time::timeout(timeout, self.open_inner()).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Link open timed out");
                Err(LinkError::Timeout)
            }
        }
    }

    async fn open_inner(self: &Arc<Self>) -> Result<(), LinkError> {
        match (&self.identity, self.direction) {
            (None, LinkDirection::Receiving) => {
                self.context.cbs.register_receiving_link(&self.name)?;
            }
            (None, LinkDirection::Sending) => {
                self.context.cbs.register_sending_link(self.clone())?;
            }
            (Some(identity), _) => {
                let client_id = identity.id();
                self.authorize(&client_id).await?;
                let listener = self.context.handler.get_device_listener().await?;
                // The listener is bound to the first identity of the connection
                if listener.identity().id() != client_id {
                    warn!(
                        %client_id,
                        bound = %listener.identity(),
                        "Link identity does not match the connection"
                    );
                    return Err(LinkError::Unauthorized(client_id));
                }
                *self.listener.lock() = Some(listener);
                self.register_capabilities();
            }
        }

        self.set_state(LinkState::Open);
        debug!("Link opened");
        Ok(())
    }

    async fn authorize(&self, client_id: &str) -> Result<(), LinkError> {
        if self.context.cbs.authenticate(client_id) {
            return Ok(());
        }

        if self.context.handler.has_sasl_principal() {
            match self.context.handler.get_amqp_authentication().await {
                Ok(authentication) if authentication.is_authenticated_for(client_id) => {
                    return Ok(())
                }
                Ok(_) => {}
                Err(err) => debug!(%err, "SASL authentication did not resolve"),
            }
        }

        warn!(%client_id, "Link is not authorized");
        Err(LinkError::Unauthorized(client_id.to_string()))
    }

    fn capabilities(&self) -> &'static [DeviceCapability] {
        match self.link_type {
            LinkType::DeviceBound => &[DeviceCapability::C2DMessages],
            LinkType::ModuleMessages => &[DeviceCapability::ModuleMessages],
            LinkType::MethodInvoke => &[DeviceCapability::MethodInvoker],
            LinkType::TwinSending => &[
                DeviceCapability::DesiredPropertyUpdates,
                DeviceCapability::TwinResponses,
            ],
            LinkType::Cbs
            | LinkType::Events
            | LinkType::MethodResponse
            | LinkType::TwinReceiving => &[],
        }
    }

    fn register_capabilities(self: &Arc<Self>) {
        let handler = &self.context.handler;
        for capability in self.capabilities() {
            let sender = self.clone();
            match capability {
                DeviceCapability::C2DMessages => handler.register_c2d_message_sender(sender),
                DeviceCapability::ModuleMessages => handler.register_module_message_sender(sender),
                DeviceCapability::MethodInvoker => handler.register_method_invoker(sender),
                DeviceCapability::DesiredPropertyUpdates => {
                    handler.register_desired_properties_update_sender(sender)
                }
                DeviceCapability::TwinResponses => handler.register_twin_response_sender(sender),
            }
        }
    }

    /// Drives the link until it is detached or the connection ends.
    ///
    /// Receiving links process their transfers in arrival order. Sending links become active
    /// and are driven by [`send_message`](Self::send_message).
    #[instrument(skip_all, fields(link = %self.name, link_type = ?self.link_type))]
    pub async fn run(self: &Arc<Self>) -> Result<(), LinkError> {
        let state = self.state();
        if state != LinkState::Open {
            return Err(LinkError::IllegalState(state));
        }

        let receiver = self.receiver.lock().await.take();
        match receiver {
            Some(link) => {
                let (link, result) = receiving::run_receiver(self, link).await;
                let mut slot = self.receiver.lock().await;
                if self.state() == LinkState::Closed {
                    // Closed while the loop owned the link
                    drop(slot);
                    if let Err(err) = link.close(None).await {
                        debug!(%err, "Link was already detached");
                    }
                } else {
                    *slot = Some(link);
                }
                result
            }
            None => {
                self.set_state(LinkState::Active);
                self.cancel.cancelled().await;
                Ok(())
            }
        }
    }

    /// Deregisters the link and detaches it. Closing twice is a no-op.
    #[instrument(skip_all, fields(link = %self.name))]
    pub async fn close(&self, error: Option<definitions::Error>) {
        {
            let mut state = self.state.lock();
            if *state == LinkState::Closed {
                return;
            }
            *state = LinkState::Closed;
        }
        self.cancel.cancel();

        match &self.identity {
            None => self.context.cbs.deregister_link(self.direction, &self.name),
            Some(_) => {
                for capability in self.capabilities() {
                    self.context.handler.deregister(*capability, &self.name);
                }
            }
        }
        self.listener.lock().take();

        let result = match self.direction {
            LinkDirection::Receiving => match self.receiver.lock().await.take() {
                Some(link) => link.close(error).await,
                None => Ok(()),
            },
            LinkDirection::Sending => match self.sender.lock().await.take() {
                Some(link) => link.close(error).await,
                None => Ok(()),
            },
        };
        match result {
            Ok(()) => debug!("Link closed"),
            Err(err) => debug!(%err, "Link was already detached"),
        }
    }
}
