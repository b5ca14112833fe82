use serde::Serialize;

use super::{
    core::AppState,
    metrics::record_notify_failure,
    types::MessageView,
};

#[derive(Debug, Serialize)]
struct MessageEventPayload {
    event: &'static str,
    message: MessageView,
}

/// Forwards a message event to the configured webhook without blocking the
/// calling request. Delivery is best effort: any failure is logged and
/// counted, never surfaced to the API caller.
pub(crate) fn forward_message_event(state: &AppState, event: &'static str, message: MessageView) {
    let Some(notify) = state.runtime.notify.clone() else {
        return;
    };
    let client = state.http_client.clone();
    let message_id = message.message_id.clone();

    tokio::spawn(async move {
        let payload = MessageEventPayload { event, message };
        let outcome = client
            .post(&notify.url)
            .timeout(notify.timeout)
            .json(&payload)
            .send()
            .await;

        match outcome {
            Ok(response) if response.status().is_success() => {
                tracing::debug!(event = "notify.sent", kind = event, message_id = %message_id);
            }
            Ok(response) => {
                tracing::warn!(
                    event = "notify.failed",
                    kind = event,
                    message_id = %message_id,
                    status = response.status().as_u16()
                );
                record_notify_failure("status");
            }
            Err(error) => {
                let reason = if error.is_timeout() { "timeout" } else { "transport" };
                tracing::warn!(
                    event = "notify.failed",
                    kind = event,
                    message_id = %message_id,
                    reason,
                    error = %error
                );
                record_notify_failure(reason);
            }
        }
    });
}
