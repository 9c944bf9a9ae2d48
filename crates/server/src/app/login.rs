//! Code-over-chat sign-in for the web dashboard.

use super::dashboard::{
    DELIVERY_FAILED, INVALID_CODE, LoginView, MISSING_NUMBER, UNKNOWN_NUMBER, VerifyView,
};
use super::delivery::{DeliveryError, deliver_access_code};
use crate::config::AccessConfig;
use crate::metrics::Metrics;
use crate::security::access::{AccessCheck, AccessCodeStore};
use crate::security::sessions::SessionStore;
use crate::transport::ChatTransport;
use crate::util::mask_code;
use poquida_proto::{jid_from_phone, normalize_phone};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct LoginFlow {
    access: Arc<AccessCodeStore>,
    sessions: Arc<SessionStore>,
    transport: Arc<dyn ChatTransport>,
    metrics: Arc<Metrics>,
    config: AccessConfig,
}

impl LoginFlow {
    pub fn new(
        access: Arc<AccessCodeStore>,
        sessions: Arc<SessionStore>,
        transport: Arc<dyn ChatTransport>,
        metrics: Arc<Metrics>,
        config: AccessConfig,
    ) -> Self {
        Self {
            access,
            sessions,
            transport,
            metrics,
            config,
        }
    }

    fn expires_minutes(&self) -> u64 {
        self.config.code_ttl.as_secs().div_ceil(60).max(1)
    }

    /// Issues a code for the typed number and sends it over chat.
    ///
    /// `Err` carries the login page to render again.
    pub async fn request_code(&self, whatsapp: &str) -> Result<VerifyView, LoginView> {
        let digits = normalize_phone(whatsapp);
        let Ok(jid) = jid_from_phone(&digits) else {
            return Err(LoginView::with_error(whatsapp, MISSING_NUMBER));
        };
        let issued = self.access.issue(&jid).await;
        self.metrics.mark_code_issued();
        debug!(jid = %jid, code = %mask_code(&issued.code), "access code issued for web login");

        match deliver_access_code(
            self.transport.as_ref(),
            &jid,
            &issued.code,
            self.config.code_ttl,
            self.config.delivery_attempts,
            self.config.delivery_interval,
        )
        .await
        {
            Ok(_) => Ok(VerifyView {
                whatsapp: digits,
                expires_minutes: self.expires_minutes(),
                error: None,
            }),
            Err(err) => {
                self.access.revoke_issued(&issued).await;
                self.metrics.mark_delivery_failed();
                warn!(jid = %jid, error = %err, "access code not delivered, code revoked");
                let message = match err {
                    DeliveryError::UnknownNumber => UNKNOWN_NUMBER,
                    DeliveryError::NotConnected | DeliveryError::Transport(_) => DELIVERY_FAILED,
                };
                Err(LoginView::with_error(&digits, message))
            }
        }
    }

    /// Checks a submitted code and opens a session on success.
    ///
    /// Returns the session token, or the verify page to render again.
    pub async fn verify(&self, whatsapp: &str, code: &str) -> Result<String, VerifyView> {
        let digits = normalize_phone(whatsapp);
        let retry = |digits: String| VerifyView {
            whatsapp: digits,
            expires_minutes: self.expires_minutes(),
            error: Some(INVALID_CODE.to_string()),
        };
        let Ok(jid) = jid_from_phone(&digits) else {
            self.metrics.mark_code_rejected();
            return Err(retry(digits));
        };
        match self.access.verify(&jid, code).await {
            AccessCheck::Valid => {
                self.metrics.mark_code_verified();
                info!(jid = %jid, "dashboard session opened");
                Ok(self.sessions.create(&jid).await)
            }
            outcome => {
                self.metrics.mark_code_rejected();
                debug!(jid = %jid, outcome = ?outcome, "access code rejected");
                Err(retry(digits))
            }
        }
    }

    /// Ends a dashboard session and drops any code still pending for its number.
    pub async fn logout(&self, token: &str) {
        if let Some(jid) = self.sessions.remove(token).await {
            let revoked = self.access.revoke(&jid).await;
            info!(jid = %jid, pending_code_revoked = revoked, "dashboard session closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::RecordingTransport;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn access_config() -> AccessConfig {
        AccessConfig {
            code_ttl: Duration::from_secs(600),
            code_length: 6,
            max_attempts: 5,
            session_ttl: Duration::from_secs(3600),
            delivery_attempts: 2,
            delivery_interval: Duration::from_millis(1),
            sweep_interval: Duration::from_secs(60),
        }
    }

    fn flow() -> (LoginFlow, Arc<RecordingTransport>, Arc<SessionStore>) {
        let transport = Arc::new(RecordingTransport::new());
        let sessions = Arc::new(SessionStore::new(Duration::from_secs(3600)));
        let flow = LoginFlow::new(
            Arc::new(AccessCodeStore::new(&access_config())),
            Arc::clone(&sessions),
            Arc::clone(&transport) as Arc<dyn ChatTransport>,
            Arc::new(Metrics::new()),
            access_config(),
        );
        (flow, transport, sessions)
    }

    fn delivered_code(transport: &RecordingTransport) -> String {
        transport
            .last_body()
            .and_then(|body| {
                body.split("Seu código: *")
                    .nth(1)
                    .and_then(|rest| rest.split('*').next())
                    .map(str::to_string)
            })
            .unwrap()
    }

    #[tokio::test]
    async fn code_round_trip_opens_session() {
        let (flow, transport, sessions) = flow();
        let view = flow.request_code("+55 (11) 98765-4321").await.ok().unwrap();
        assert_eq!(view.whatsapp, "5511987654321");
        assert_eq!(view.expires_minutes, 10);
        assert_eq!(transport.sent()[0].0, "5511987654321@s.whatsapp.net");

        let code = delivered_code(&transport);
        let token = flow.verify("5511987654321", &code).await.ok().unwrap();
        assert_eq!(
            sessions.resolve(&token).await.as_deref(),
            Some("5511987654321@s.whatsapp.net")
        );
        let reused = flow.verify("5511987654321", &code).await;
        assert_eq!(
            reused.err().and_then(|view| view.error).as_deref(),
            Some(INVALID_CODE)
        );
    }

    #[tokio::test]
    async fn empty_number_is_rejected_without_sending() {
        let (flow, transport, _) = flow();
        let view = flow.request_code("abc").await.err().unwrap();
        assert_eq!(view.error.as_deref(), Some(MISSING_NUMBER));
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn failed_delivery_revokes_code() {
        let (flow, transport, _) = flow();
        transport.failing_sends.store(2, Ordering::SeqCst);
        let view = flow.request_code("5511987654321").await.err().unwrap();
        assert_eq!(view.error.as_deref(), Some(DELIVERY_FAILED));
        assert!(flow.access.verify("5511987654321@s.whatsapp.net", "000000").await == AccessCheck::Missing);

        transport.registered.store(false, Ordering::SeqCst);
        let unknown = flow.request_code("5511987654321").await.err().unwrap();
        assert_eq!(unknown.error.as_deref(), Some(UNKNOWN_NUMBER));
    }

    #[tokio::test]
    async fn logout_closes_session_and_pending_code() {
        let (flow, transport, sessions) = flow();
        flow.request_code("5511987654321").await.ok().unwrap();
        let token = flow
            .verify("5511987654321", &delivered_code(&transport))
            .await
            .ok()
            .unwrap();

        flow.request_code("5511987654321").await.ok().unwrap();
        let pending = delivered_code(&transport);
        flow.logout(&token).await;
        assert!(sessions.resolve(&token).await.is_none());
        assert!(flow.verify("5511987654321", &pending).await.is_err());

        flow.logout(&token).await;
        assert!(sessions.resolve(&token).await.is_none());
    }

    #[tokio::test]
    async fn wrong_code_keeps_verify_page() {
        let (flow, transport, _) = flow();
        flow.request_code("5511987654321").await.ok().unwrap();
        let code = delivered_code(&transport);
        let wrong = if code == "000000" { "111111" } else { "000000" };
        let view = flow.verify("5511987654321", wrong).await.err().unwrap();
        assert_eq!(view.whatsapp, "5511987654321");
        assert_eq!(view.error.as_deref(), Some(INVALID_CODE));
        assert!(flow.verify("5511987654321", &code).await.is_ok());
    }
}
