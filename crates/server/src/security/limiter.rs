use crate::config::{RateLimitConfig, RateLimitSettings};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateScope {
    Http,
    /// Code issuance; each hit sends a chat message.
    Login,
    Verify,
}

#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    pub allowed: bool,
    pub retry_after: Option<Duration>,
}

impl RateDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            retry_after: None,
        }
    }

    fn deny(retry_after: Duration) -> Self {
        Self {
            allowed: false,
            retry_after: Some(retry_after),
        }
    }
}

#[derive(Debug, Clone)]
struct RateState {
    hits: VecDeque<Instant>,
    blocked_until: Option<Instant>,
    last_seen: Instant,
}

impl RateState {
    fn new(now: Instant) -> Self {
        Self {
            hits: VecDeque::new(),
            blocked_until: None,
            last_seen: now,
        }
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    settings: HashMap<RateScope, RateLimitSettings>,
    states: Mutex<HashMap<(RateScope, String), RateState>>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        let mut settings = HashMap::new();
        settings.insert(RateScope::Http, config.http.clone());
        settings.insert(RateScope::Login, config.login.clone());
        settings.insert(RateScope::Verify, config.verify.clone());
        Self {
            settings,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Records a hit for `key` in `scope` and decides whether it may proceed.
    pub async fn check(&self, scope: RateScope, key: &str) -> RateDecision {
        let Some(settings) = self.settings.get(&scope) else {
            return RateDecision::allow();
        };
        let now = Instant::now();
        let mut guard = self.states.lock().await;
        let entry = guard
            .entry((scope, key.to_string()))
            .or_insert_with(|| RateState::new(now));
        entry.last_seen = now;
        while let Some(front) = entry.hits.front() {
            if now.duration_since(*front) > settings.window {
                entry.hits.pop_front();
            } else {
                break;
            }
        }
        if let Some(until) = entry.blocked_until {
            if now < until {
                return RateDecision::deny(until.saturating_duration_since(now));
            }
            entry.blocked_until = None;
        }
        if entry.hits.len() < settings.burst as usize {
            entry.hits.push_back(now);
            return RateDecision::allow();
        }
        if settings.penalty.is_zero() {
            return RateDecision::deny(settings.window);
        }
        entry.blocked_until = Some(now + settings.penalty);
        RateDecision::deny(settings.penalty)
    }

    /// Drops clients that have been quiet for longer than their window.
    pub async fn purge_idle(&self) -> usize {
        let now = Instant::now();
        let mut guard = self.states.lock().await;
        let before = guard.len();
        guard.retain(|(scope, _), state| {
            let window = self
                .settings
                .get(scope)
                .map(|settings| settings.window)
                .unwrap_or_default();
            let blocked = state.blocked_until.is_some_and(|until| now < until);
            blocked || now.duration_since(state.last_seen) <= window
        });
        before - guard.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;
    use tokio::time::{Duration, sleep};

    fn make_config() -> RateLimitConfig {
        let settings = RateLimitSettings {
            burst: 2,
            window: StdDuration::from_millis(50),
            penalty: StdDuration::from_millis(80),
        };
        RateLimitConfig {
            http: settings.clone(),
            login: settings.clone(),
            verify: settings,
        }
    }

    #[tokio::test]
    async fn allows_within_burst() {
        let limiter = RateLimiter::new(&make_config());
        let identity = "client-allow";
        assert!(limiter.check(RateScope::Http, identity).await.allowed);
        assert!(limiter.check(RateScope::Http, identity).await.allowed);
    }

    #[tokio::test]
    async fn blocks_and_recovers_after_penalty() {
        let limiter = RateLimiter::new(&make_config());
        let identity = "client-penalty";
        assert!(limiter.check(RateScope::Http, identity).await.allowed);
        assert!(limiter.check(RateScope::Http, identity).await.allowed);
        let decision = limiter.check(RateScope::Http, identity).await;
        assert!(!decision.allowed);
        let retry = decision.retry_after.expect("retry");
        assert!(retry >= StdDuration::from_millis(70));
        sleep(Duration::from_millis(90)).await;
        let decision_after = limiter.check(RateScope::Http, identity).await;
        assert!(decision_after.allowed);
    }

    #[tokio::test]
    async fn scopes_and_clients_are_independent() {
        let limiter = RateLimiter::new(&make_config());
        let identity = "client-scopes";
        for _ in 0..2 {
            assert!(limiter.check(RateScope::Login, identity).await.allowed);
        }
        assert!(!limiter.check(RateScope::Login, identity).await.allowed);
        assert!(limiter.check(RateScope::Verify, identity).await.allowed);
        assert!(limiter.check(RateScope::Login, "client-other").await.allowed);
    }

    #[tokio::test]
    async fn uses_window_when_penalty_zero() {
        let mut config = make_config();
        config.http.penalty = StdDuration::ZERO;
        let limiter = RateLimiter::new(&config);
        let identity = "client-window";
        for _ in 0..config.http.burst {
            assert!(limiter.check(RateScope::Http, identity).await.allowed);
        }
        let decision = limiter.check(RateScope::Http, identity).await;
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after, Some(config.http.window));
    }

    #[tokio::test]
    async fn idle_clients_are_purged() {
        let limiter = RateLimiter::new(&make_config());
        assert!(limiter.check(RateScope::Verify, "client-idle").await.allowed);
        assert_eq!(limiter.purge_idle().await, 0);
        sleep(Duration::from_millis(70)).await;
        assert_eq!(limiter.purge_idle().await, 1);
    }
}
