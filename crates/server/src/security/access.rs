use crate::config::AccessConfig;
use chrono::{DateTime, Utc};
use rand::{Rng, rngs::OsRng};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use subtle::ConstantTimeEq;
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCode {
    pub jid: String,
    pub code: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessCheck {
    Missing,
    Expired,
    Valid,
    Mismatch { remaining: u32 },
}

#[derive(Debug)]
struct PendingCode {
    code: String,
    expires_at: Instant,
    attempts: u32,
}

/// Single-use dashboard codes, one per chat account.
#[derive(Debug)]
pub struct AccessCodeStore {
    ttl: Duration,
    code_length: usize,
    max_attempts: u32,
    codes: Mutex<HashMap<String, PendingCode>>,
}

impl AccessCodeStore {
    pub fn new(config: &AccessConfig) -> Self {
        Self {
            ttl: config.code_ttl,
            code_length: config.code_length,
            max_attempts: config.max_attempts.max(1),
            codes: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Stores a fresh code for `jid`, replacing any earlier one.
    pub async fn issue(&self, jid: &str) -> IssuedCode {
        let code = generate_code(self.code_length);
        let expires_at = Utc::now()
            + chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::minutes(10));
        let mut codes = self.codes.lock().await;
        codes.insert(
            jid.to_string(),
            PendingCode {
                code: code.clone(),
                expires_at: Instant::now() + self.ttl,
                attempts: 0,
            },
        );
        IssuedCode {
            jid: jid.to_string(),
            code,
            expires_at,
        }
    }

    pub async fn verify(&self, jid: &str, input: &str) -> AccessCheck {
        let candidate = input.trim();
        let mut codes = self.codes.lock().await;
        let Some(pending) = codes.get_mut(jid) else {
            return AccessCheck::Missing;
        };
        if Instant::now() > pending.expires_at {
            codes.remove(jid);
            return AccessCheck::Expired;
        }
        if bool::from(pending.code.as_bytes().ct_eq(candidate.as_bytes())) {
            codes.remove(jid);
            return AccessCheck::Valid;
        }
        pending.attempts += 1;
        let remaining = self.max_attempts.saturating_sub(pending.attempts);
        if remaining == 0 {
            codes.remove(jid);
        }
        AccessCheck::Mismatch { remaining }
    }

    pub async fn revoke(&self, jid: &str) -> bool {
        self.codes.lock().await.remove(jid).is_some()
    }

    /// Revokes the code for `jid` only while it is still `code`.
    ///
    /// A failed delivery of an older code must not drop a newer one.
    pub async fn revoke_issued(&self, issued: &IssuedCode) -> bool {
        let mut codes = self.codes.lock().await;
        let current = codes
            .get(&issued.jid)
            .map(|pending| bool::from(pending.code.as_bytes().ct_eq(issued.code.as_bytes())))
            .unwrap_or(false);
        if current {
            codes.remove(&issued.jid);
        }
        current
    }

    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut codes = self.codes.lock().await;
        let before = codes.len();
        codes.retain(|_, pending| pending.expires_at >= now);
        before - codes.len()
    }
}

fn generate_code(length: usize) -> String {
    let mut rng = OsRng;
    (0..length)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect()
}
