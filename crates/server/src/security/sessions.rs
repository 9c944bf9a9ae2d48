use crate::util::random_token;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

pub const SESSION_COOKIE: &str = "poquida_session";
const TOKEN_BYTES: usize = 32;

#[derive(Debug)]
struct SessionEntry {
    jid: String,
    expires_at: Instant,
}

/// Dashboard sessions created after a successful code check.
#[derive(Debug)]
pub struct SessionStore {
    ttl: Duration,
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub async fn create(&self, jid: &str) -> String {
        let token = random_token(TOKEN_BYTES);
        self.sessions.lock().await.insert(
            token.clone(),
            SessionEntry {
                jid: jid.to_string(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        token
    }

    /// Returns the JID bound to `token` while the session is live.
    pub async fn resolve(&self, token: &str) -> Option<String> {
        let mut sessions = self.sessions.lock().await;
        let expired = match sessions.get(token) {
            Some(entry) if Instant::now() <= entry.expires_at => return Some(entry.jid.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            sessions.remove(token);
        }
        None
    }

    /// Drops a session and returns the JID it belonged to.
    pub async fn remove(&self, token: &str) -> Option<String> {
        self.sessions.lock().await.remove(token).map(|entry| entry.jid)
    }

    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();
        sessions.retain(|_, entry| entry.expires_at >= now);
        before - sessions.len()
    }

    /// `Set-Cookie` value carrying a fresh session token.
    pub fn cookie(&self, token: &str, secure: bool) -> String {
        let mut cookie = format!(
            "{}={}; Path=/; Max-Age={}; HttpOnly; SameSite=Lax",
            SESSION_COOKIE,
            token,
            self.ttl.as_secs()
        );
        if secure {
            cookie.push_str("; Secure");
        }
        cookie
    }

    pub fn clear_cookie(secure: bool) -> String {
        let mut cookie = format!(
            "{}=; Path=/; Max-Age=0; HttpOnly; SameSite=Lax",
            SESSION_COOKIE
        );
        if secure {
            cookie.push_str("; Secure");
        }
        cookie
    }
}
