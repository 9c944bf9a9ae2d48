use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Metrics {
    messages_inbound: AtomicU64,
    messages_duplicate: AtomicU64,
    expenses_recorded: AtomicU64,
    codes_issued: AtomicU64,
    codes_verified: AtomicU64,
    codes_rejected: AtomicU64,
    code_deliveries_failed: AtomicU64,
    gateway_reconnects: AtomicU64,
    http_ingress: AtomicU64,
    http_egress: AtomicU64,
    http_rate_limited: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub messages_inbound: u64,
    pub messages_duplicate: u64,
    pub expenses_recorded: u64,
    pub codes_issued: u64,
    pub codes_verified: u64,
    pub codes_rejected: u64,
    pub code_deliveries_failed: u64,
    pub gateway_reconnects: u64,
    pub http_ingress: u64,
    pub http_egress: u64,
    pub http_rate_limited: u64,
}

/// Payload of `/healthz`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: String,
    pub uptime_seconds: u64,
    pub version: String,
    pub gateway: String,
    pub bot_jid: Option<String>,
    pub counters: CounterSnapshot,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_inbound(&self) {
        self.messages_inbound.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_duplicate(&self) {
        self.messages_duplicate.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_expense(&self) {
        self.expenses_recorded.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_code_issued(&self) {
        self.codes_issued.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_code_verified(&self) {
        self.codes_verified.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_code_rejected(&self) {
        self.codes_rejected.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_delivery_failed(&self) {
        self.code_deliveries_failed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_reconnect(&self) {
        self.gateway_reconnects.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_ingress(&self) {
        self.http_ingress.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_egress(&self) {
        self.http_egress.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_http_rate_limited(&self) {
        self.http_rate_limited.fetch_add(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            messages_inbound: self.messages_inbound.load(Ordering::SeqCst),
            messages_duplicate: self.messages_duplicate.load(Ordering::SeqCst),
            expenses_recorded: self.expenses_recorded.load(Ordering::SeqCst),
            codes_issued: self.codes_issued.load(Ordering::SeqCst),
            codes_verified: self.codes_verified.load(Ordering::SeqCst),
            codes_rejected: self.codes_rejected.load(Ordering::SeqCst),
            code_deliveries_failed: self.code_deliveries_failed.load(Ordering::SeqCst),
            gateway_reconnects: self.gateway_reconnects.load(Ordering::SeqCst),
            http_ingress: self.http_ingress.load(Ordering::SeqCst),
            http_egress: self.http_egress.load(Ordering::SeqCst),
            http_rate_limited: self.http_rate_limited.load(Ordering::SeqCst),
        }
    }

    pub fn encode_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        let counters = [
            ("poquida_messages_inbound", snapshot.messages_inbound),
            ("poquida_messages_duplicate", snapshot.messages_duplicate),
            ("poquida_expenses_recorded", snapshot.expenses_recorded),
            ("poquida_codes_issued", snapshot.codes_issued),
            ("poquida_codes_verified", snapshot.codes_verified),
            ("poquida_codes_rejected", snapshot.codes_rejected),
            (
                "poquida_code_deliveries_failed",
                snapshot.code_deliveries_failed,
            ),
            ("poquida_gateway_reconnects", snapshot.gateway_reconnects),
            ("poquida_http_ingress", snapshot.http_ingress),
            ("poquida_http_egress", snapshot.http_egress),
            ("poquida_http_rate_limited", snapshot.http_rate_limited),
        ];
        let mut output = String::new();
        for (name, value) in counters {
            output.push_str(&format!("# TYPE {name} counter\n{name} {value}\n"));
        }
        output
    }
}
