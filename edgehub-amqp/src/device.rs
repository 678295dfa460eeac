//! Seams to the device messaging layer behind the protocol head

use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    connection::DeviceProxy,
    error::ListenerError,
    identity::Identity,
    message::{DirectMethodResponse, FeedbackStatus, InternalMessage},
};

/// Broker side listener for a single device or module identity
#[async_trait]
pub trait DeviceListener: Send + Sync {
    fn identity(&self) -> &Identity;

    /// Hands the listener the proxy it uses to push messages toward the device
    fn bind_device_proxy(&self, proxy: Arc<DeviceProxy>);

    /// Messages of one transfer, delivered as one call
    async fn process_device_message_batch(
        &self,
        messages: Vec<InternalMessage>,
    ) -> Result<(), ListenerError>;

    async fn process_message_feedback(
        &self,
        lock_token: String,
        status: FeedbackStatus,
    ) -> Result<(), ListenerError>;

    async fn add_desired_property_updates_subscription(
        &self,
        correlation_id: String,
    ) -> Result<(), ListenerError>;

    async fn remove_desired_property_updates_subscription(
        &self,
        correlation_id: String,
    ) -> Result<(), ListenerError>;

    async fn send_get_twin_request(&self, correlation_id: String) -> Result<(), ListenerError>;

    async fn update_reported_properties(
        &self,
        reported_properties: InternalMessage,
        correlation_id: String,
    ) -> Result<(), ListenerError>;

    /// Method response that does not match a call made through the proxy
    async fn process_method_response(
        &self,
        response: DirectMethodResponse,
    ) -> Result<(), ListenerError>;
}

/// Provides the device listener of an authenticated identity
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    async fn get_device_listener(
        &self,
        identity: Identity,
    ) -> Result<Arc<dyn DeviceListener>, ListenerError>;
}
