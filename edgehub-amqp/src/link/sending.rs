//! Message delivery on sending links

use async_trait::async_trait;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::{error::LinkError, message::FeedbackStatus};

use super::{
    DeliveryOutcome, LinkHandler, LinkState, OutboundMessage, OutboundSender, OutgoingTransfer,
};

impl LinkHandler {
    /// Converts and sends a message. Outcomes of unsettled deliveries are reported to the
    /// device listener as feedback for the lock token of the message.
    #[instrument(skip_all, fields(link = %self.name))]
    pub async fn send_message(&self, message: OutboundMessage) -> Result<(), LinkError> {
        let state = self.state();
        if !matches!(state, LinkState::Open | LinkState::Active) {
            return Err(LinkError::IllegalState(state));
        }

        let (message, lock_token) = match message {
            OutboundMessage::Device(message) => (
                self.converter.from_message(&message)?,
                message.lock_token().map(str::to_string),
            ),
            OutboundMessage::MethodRequest(request) => {
                (self.method_converter.from_request(&request), None)
            }
            OutboundMessage::Raw(message) => (message, None),
        };

        let transfer = OutgoingTransfer {
            delivery_tag: delivery_tag(lock_token.as_deref()),
            message,
            settled: self.qos().is_settled(),
        };

        let outcome = {
            let mut slot = self.sender.lock().await;
            let link = slot
                .as_mut()
                .ok_or(LinkError::IllegalState(LinkState::Closed))?;
            link.send(transfer).await?
        };

        let status = outcome.and_then(feedback_status);
        if let (Some(status), Some(lock_token)) = (status, lock_token) {
            debug!(%lock_token, ?status, "Reporting delivery feedback");
            if let Some(listener) = self.listener() {
                listener.process_message_feedback(lock_token, status).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl OutboundSender for LinkHandler {
    fn link_name(&self) -> &str {
        &self.name
    }

    async fn send(&self, message: OutboundMessage) -> Result<(), LinkError> {
        self.send_message(message).await
    }
}

/// Delivery tag derived from the lock token: UUID bytes when the token is a UUID, its UTF-8
/// bytes otherwise, a random UUID when there is no token
pub(crate) fn delivery_tag(lock_token: Option<&str>) -> Vec<u8> {
    match lock_token {
        Some(token) => match Uuid::parse_str(token) {
            Ok(uuid) => uuid.as_bytes().to_vec(),
            Err(_) => token.as_bytes().to_vec(),
        },
        None => Uuid::new_v4().as_bytes().to_vec(),
    }
}

fn feedback_status(outcome: DeliveryOutcome) -> Option<FeedbackStatus> {
    match outcome {
        DeliveryOutcome::Accepted => Some(FeedbackStatus::Complete),
        DeliveryOutcome::Rejected => Some(FeedbackStatus::Reject),
        DeliveryOutcome::Released => Some(FeedbackStatus::Abandon),
        DeliveryOutcome::Modified => None,
    }
}
