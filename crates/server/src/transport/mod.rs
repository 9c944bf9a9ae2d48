pub mod dedup;
pub mod gateway;

use async_trait::async_trait;
use poquida_proto::{CodecError, OutboundContent};
use std::fmt::{self, Display, Formatter};

pub use dedup::SeenSet;
pub use gateway::GatewayClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Reconnecting(u32),
    /// The linked device was removed; only a new pairing recovers.
    LoggedOut,
}

impl ConnectionState {
    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionState::Open)
    }
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Open => write!(f, "open"),
            ConnectionState::Reconnecting(attempt) => write!(f, "reconnecting({})", attempt),
            ConnectionState::LoggedOut => write!(f, "logged_out"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("chat transport is not connected")]
    NotConnected,
    #[error("gateway connection dropped")]
    Disconnected,
    #[error("gateway did not answer in time")]
    Timeout,
    #[error("gateway rejected the command: {0}")]
    Rejected(String),
    #[error("gateway network failure: {0}")]
    Network(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Outbound side of the chat channel.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Sends a message and returns the id the network assigned to it.
    async fn send(&self, jid: &str, content: OutboundContent) -> Result<String, TransportError>;
    async fn is_registered(&self, jid: &str) -> Result<bool, TransportError>;
    async fn is_ready(&self) -> bool;
    async fn own_jid(&self) -> Option<String>;
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// In-memory transport that records every message it is asked to send.
    pub struct RecordingTransport {
        pub ready: AtomicBool,
        pub registered: AtomicBool,
        /// Number of upcoming sends that fail before one succeeds.
        pub failing_sends: AtomicU32,
        pub sent: Mutex<Vec<(String, OutboundContent)>>,
    }

    impl RecordingTransport {
        pub fn new() -> Self {
            Self {
                ready: AtomicBool::new(true),
                registered: AtomicBool::new(true),
                failing_sends: AtomicU32::new(0),
                sent: Mutex::new(Vec::new()),
            }
        }

        pub fn sent(&self) -> Vec<(String, OutboundContent)> {
            self.sent.lock().unwrap().clone()
        }

        pub fn last_body(&self) -> Option<String> {
            self.sent
                .lock()
                .unwrap()
                .last()
                .map(|(_, content)| content.body().to_string())
        }
    }

    #[async_trait]
    impl ChatTransport for RecordingTransport {
        async fn send(
            &self,
            jid: &str,
            content: OutboundContent,
        ) -> Result<String, TransportError> {
            let failing = self.failing_sends.load(Ordering::SeqCst);
            if failing > 0 {
                self.failing_sends.store(failing - 1, Ordering::SeqCst);
                return Err(TransportError::Timeout);
            }
            let mut sent = self.sent.lock().unwrap();
            sent.push((jid.to_string(), content));
            Ok(format!("MSG{}", sent.len()))
        }

        async fn is_registered(&self, _jid: &str) -> Result<bool, TransportError> {
            Ok(self.registered.load(Ordering::SeqCst))
        }

        async fn is_ready(&self) -> bool {
            self.ready.load(Ordering::SeqCst)
        }

        async fn own_jid(&self) -> Option<String> {
            Some("5511900000000@s.whatsapp.net".to_string())
        }
    }
}
