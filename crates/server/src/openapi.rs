use crate::security::sessions::SESSION_COOKIE;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::OnceLock;
use utoipa::openapi::security::{
    ApiKey, ApiKeyValue, HttpAuthScheme, HttpBuilder, SecurityScheme,
};
use utoipa::{Modify, OpenApi, ToSchema};

static OPENAPI_JSON: OnceLock<String> = OnceLock::new();

/// Returns the OpenAPI specification as a JSON string.
pub fn openapi_json() -> &'static str {
    OPENAPI_JSON.get_or_init(|| {
        ApiDoc::openapi()
            .to_pretty_json()
            .unwrap_or_else(|_| "{}".to_string())
    })
}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "PoquidaGrana Dashboard API",
        version = "1.0.0",
        description = r#"JSON endpoints of the expense dashboard. Pages (`/`, `/login`, `/verify`, `/dashboard`) are HTML and not described here."#
    ),
    servers(
        (
            url = "https://{domain}",
            description = "Production server",
            variables(("domain" = (default = "poquida.up.railway.app")))
        ),
        (url = "http://localhost:8080", description = "Local development")
    ),
    components(
        schemas(ProblemDetails, CategoryFigures, ChartData, CounterReport, HealthReport)
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Dashboard", description = "Expense figures for the signed-in account"),
        (name = "Operations", description = "Health and metrics")
    ),
    paths(chart_data_endpoint, healthz_endpoint, readyz_endpoint, metrics_endpoint)
)]
pub struct ApiDoc;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "SessionCookie",
            SecurityScheme::ApiKey(ApiKey::Cookie(ApiKeyValue::with_description(
                SESSION_COOKIE,
                "Set by POST /verify after a valid access code",
            ))),
        );
        components.add_security_scheme(
            "AdminToken",
            SecurityScheme::Http(
                HttpBuilder::new()
                    .scheme(HttpAuthScheme::Bearer)
                    .description(Some("admin.token from the server configuration"))
                    .build(),
            ),
        );
    }
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct ProblemDetails {
    #[schema(example = "about:blank")]
    pub r#type: String,
    #[schema(example = "Unauthorized")]
    pub title: String,
    #[schema(example = 401)]
    pub status: i32,
    #[schema(nullable = true, example = "session required")]
    pub detail: Option<String>,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct CategoryFigures {
    #[schema(example = 182.4)]
    pub total: f64,
    #[schema(example = 7)]
    pub count: u64,
}

/// Mirrors the statistics served by `/api/chart-data`.
#[derive(Serialize, Deserialize, ToSchema)]
pub struct ChartData {
    #[schema(example = 431.9)]
    pub total: f64,
    #[schema(example = 18)]
    pub count: u64,
    pub categories: BTreeMap<String, CategoryFigures>,
    /// Totals keyed `YYYY-MM`.
    pub months: BTreeMap<String, f64>,
    #[schema(nullable = true, example = 120.0)]
    pub largest: Option<f64>,
    #[schema(nullable = true, example = 3.5)]
    pub smallest: Option<f64>,
    #[schema(nullable = true, example = 23.99)]
    pub average: Option<f64>,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct CounterReport {
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

#[derive(Serialize, Deserialize, ToSchema)]
pub struct HealthReport {
    #[schema(example = "healthy")]
    pub status: String,
    pub uptime_seconds: u64,
    #[schema(example = "0.1.0")]
    pub version: String,
    #[schema(example = "open")]
    pub gateway: String,
    #[schema(nullable = true, example = "5511900000000@s.whatsapp.net")]
    pub bot_jid: Option<String>,
    pub counters: CounterReport,
}

// Markers for document generation only.
#[allow(dead_code)]
#[utoipa::path(
    get,
    path = "/api/chart-data",
    tag = "Dashboard",
    security(("SessionCookie" = [])),
    responses(
        (status = 200, description = "Expense statistics", body = ChartData),
        (status = 401, description = "No live session", body = ProblemDetails, content_type = "application/problem+json"),
        (status = 500, description = "Storage failure", body = ProblemDetails, content_type = "application/problem+json")
    )
)]
pub fn chart_data_endpoint() {}

#[allow(dead_code)]
#[utoipa::path(
    get,
    path = "/healthz",
    tag = "Operations",
    responses((status = 200, description = "Process health", body = HealthReport))
)]
pub fn healthz_endpoint() {}

#[allow(dead_code)]
#[utoipa::path(
    get,
    path = "/readyz",
    tag = "Operations",
    responses(
        (status = 200, description = "Storage reachable", body = String, content_type = "text/plain"),
        (status = 503, description = "Storage unreachable", body = String, content_type = "text/plain")
    )
)]
pub fn readyz_endpoint() {}

#[allow(dead_code)]
#[utoipa::path(
    get,
    path = "/metrics",
    tag = "Operations",
    security(("AdminToken" = [])),
    responses(
        (status = 200, description = "Prometheus exposition", body = String, content_type = "text/plain; version=0.0.4"),
        (status = 401, description = "Admin token missing or wrong", body = ProblemDetails, content_type = "application/problem+json")
    )
)]
pub fn metrics_endpoint() {}
