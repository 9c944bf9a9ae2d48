use super::replies::access_code_delivery;
use crate::transport::{ChatTransport, TransportError};
use crate::util::mask_code;
use poquida_proto::OutboundContent;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("chat channel is not connected")]
    NotConnected,
    #[error("number is not registered on WhatsApp")]
    UnknownNumber,
    #[error("code delivery failed: {0}")]
    Transport(#[from] TransportError),
}

/// Sends an access code over chat, retrying `attempts` times `interval` apart.
///
/// Returns the message id of the first successful send.
pub async fn deliver_access_code(
    transport: &dyn ChatTransport,
    jid: &str,
    code: &str,
    ttl: Duration,
    attempts: u32,
    interval: Duration,
) -> Result<String, DeliveryError> {
    if !transport.is_ready().await {
        return Err(DeliveryError::NotConnected);
    }
    if !transport.is_registered(jid).await? {
        return Err(DeliveryError::UnknownNumber);
    }
    let attempts = attempts.max(1);
    let text = access_code_delivery(code, ttl);
    let mut last_error = TransportError::NotConnected;
    for attempt in 1..=attempts {
        debug!(jid = %jid, code = %mask_code(code), attempt, "delivering access code");
        match transport.send(jid, OutboundContent::text(text.clone())).await {
            Ok(message_id) => {
                info!(jid = %jid, message_id = %message_id, attempt, "access code delivered");
                return Ok(message_id);
            }
            Err(err) => {
                warn!(jid = %jid, attempt, error = %err, "access code delivery attempt failed");
                last_error = err;
            }
        }
        if attempt < attempts {
            sleep(interval).await;
        }
    }
    Err(DeliveryError::Transport(last_error))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::RecordingTransport;
    use std::sync::atomic::Ordering;

    const JID: &str = "5511987654321@s.whatsapp.net";

    #[tokio::test]
    async fn delivers_on_first_try() {
        let transport = RecordingTransport::new();
        let id = deliver_access_code(
            &transport,
            JID,
            "482913",
            Duration::from_secs(600),
            3,
            Duration::from_millis(1),
        )
        .await
        .unwrap();
        assert_eq!(id, "MSG1");
        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, JID);
        assert!(sent[0].1.body().contains("Seu código: *482913*"));
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let transport = RecordingTransport::new();
        transport.failing_sends.store(2, Ordering::SeqCst);
        let id = deliver_access_code(
            &transport,
            JID,
            "482913",
            Duration::from_secs(600),
            3,
            Duration::from_millis(1),
        )
        .await
        .unwrap();
        assert_eq!(id, "MSG1");
    }

    #[tokio::test]
    async fn gives_up_after_last_attempt() {
        let transport = RecordingTransport::new();
        transport.failing_sends.store(5, Ordering::SeqCst);
        let result = deliver_access_code(
            &transport,
            JID,
            "482913",
            Duration::from_secs(600),
            3,
            Duration::from_millis(1),
        )
        .await;
        assert!(matches!(
            result,
            Err(DeliveryError::Transport(TransportError::Timeout))
        ));
        assert_eq!(transport.failing_sends.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn refuses_unready_or_unknown_recipients() {
        let transport = RecordingTransport::new();
        transport.ready.store(false, Ordering::SeqCst);
        let offline = deliver_access_code(
            &transport,
            JID,
            "1",
            Duration::from_secs(600),
            3,
            Duration::from_millis(1),
        )
        .await;
        assert!(matches!(offline, Err(DeliveryError::NotConnected)));

        transport.ready.store(true, Ordering::SeqCst);
        transport.registered.store(false, Ordering::SeqCst);
        let unknown = deliver_access_code(
            &transport,
            JID,
            "1",
            Duration::from_secs(600),
            3,
            Duration::from_millis(1),
        )
        .await;
        assert!(matches!(unknown, Err(DeliveryError::UnknownNumber)));
        assert!(transport.sent().is_empty());
    }
}
