use tracing::debug;

use causerie_net::SessionManager;
use causerie_shared::{AppDestination, ChatEnvelope, UserId};

use crate::error::ClientError;
use crate::router::MessageRouter;

/// Publish a chat line. Returns the envelope so the caller can show it
/// right away; the broker does not echo it back.
pub async fn send_message(
    transport: &SessionManager,
    router: &MessageRouter,
    content: &str,
    receiver: Option<UserId>,
) -> Result<ChatEnvelope, ClientError> {
    let content = content.trim();
    if content.is_empty() {
        return Err(ClientError::EmptyMessage);
    }
    check_receiver(router, receiver.as_ref())?;

    let envelope = router.compose_chat(content, receiver);
    transport
        .publish(AppDestination::SendMessage, envelope.to_json()?)
        .await?;
    debug!(envelope = %envelope, "Message sent");
    Ok(envelope)
}

pub(crate) fn check_receiver(
    router: &MessageRouter,
    receiver: Option<&UserId>,
) -> Result<(), ClientError> {
    match receiver {
        Some(user) if user == router.local_user() => Err(ClientError::SelfAddressed),
        _ => Ok(()),
    }
}
