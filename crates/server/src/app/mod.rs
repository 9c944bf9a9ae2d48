pub mod bot;
pub mod dashboard;
pub mod delivery;
pub mod login;
pub mod replies;

use self::bot::Bot;
use self::dashboard::{DashboardView, LoginView};
use self::login::LoginFlow;
use crate::config::{AiConfig, ServerConfig};
use crate::metrics::{HealthSnapshot, Metrics};
use crate::openapi;
use crate::security::access::AccessCodeStore;
use crate::security::limiter::{RateLimiter, RateScope};
use crate::security::sessions::{SESSION_COOKIE, SessionStore};
use crate::transport::{ChatTransport, GatewayClient, SeenSet};
use crate::util::{cookie_value, parse_form};
use askama::Template;
use poquida_intent::{
    IntentError, IntentExtractor, KeywordExtractor, LanguageModelExtractor, ModelConfig,
};
use poquida_proto::phone_from_jid;
use poquida_storage::{ExpenseStats, ExpenseStore, Storage, StorageError, connect};
use pingora::apps::{HttpServerApp, HttpServerOptions, ReusedHttpStream};
use pingora::http::ResponseHeader;
use pingora::protocols::http::ServerSession;
use pingora::protocols::http::v2::server::H2Options;
use pingora::server::ShutdownWatch;
use serde_json::json;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};
use subtle::ConstantTimeEq;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

const MAX_BODY_SIZE: usize = 64 * 1024;

#[derive(Debug)]
pub enum ServerError {
    Storage,
    Intent,
    Render,
    Invalid,
    Io,
}

impl Display for ServerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Storage => write!(f, "storage failure"),
            Self::Intent => write!(f, "intent extractor failure"),
            Self::Render => write!(f, "template rendering failure"),
            Self::Invalid => write!(f, "invalid response"),
            Self::Io => write!(f, "io failure"),
        }
    }
}

impl Error for ServerError {}

impl From<StorageError> for ServerError {
    fn from(_: StorageError) -> Self {
        Self::Storage
    }
}

impl From<IntentError> for ServerError {
    fn from(_: IntentError) -> Self {
        Self::Intent
    }
}

impl From<askama::Error> for ServerError {
    fn from(_: askama::Error) -> Self {
        Self::Render
    }
}

#[derive(Debug)]
enum ApiError {
    Unauthorized(Option<String>),
    BadRequest(String),
    NotFound,
    MethodNotAllowed,
    PayloadTooLarge,
    Internal,
}

impl ApiError {
    fn status(&self) -> u16 {
        match self {
            Self::Unauthorized(_) => 401,
            Self::BadRequest(_) => 400,
            Self::NotFound => 404,
            Self::MethodNotAllowed => 405,
            Self::PayloadTooLarge => 413,
            Self::Internal => 500,
        }
    }

    fn title(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "Unauthorized",
            Self::BadRequest(_) => "BadRequest",
            Self::NotFound => "NotFound",
            Self::MethodNotAllowed => "MethodNotAllowed",
            Self::PayloadTooLarge => "PayloadTooLarge",
            Self::Internal => "InternalError",
        }
    }

    fn detail(&self) -> &str {
        match self {
            Self::Unauthorized(reason) => reason.as_deref().unwrap_or("authorization required"),
            Self::BadRequest(reason) => reason.as_str(),
            Self::NotFound => "resource not found",
            Self::MethodNotAllowed => "method not allowed for this resource",
            Self::PayloadTooLarge => "request body exceeds 64 KiB",
            Self::Internal => "internal server error",
        }
    }
}

#[derive(Debug)]
enum Route {
    Index,
    Login,
    Verify,
    Dashboard,
    ChartData,
    Logout,
    Qr,
    Healthz,
    Readyz,
    Metrics,
    OpenApi,
    Rejected(ApiError),
}

const KNOWN_PATHS: &[&str] = &[
    "/",
    "/index.html",
    "/login",
    "/verify",
    "/dashboard",
    "/api/chart-data",
    "/logout",
    "/qr",
    "/healthz",
    "/readyz",
    "/metrics",
    "/openapi.json",
];

/// Known paths with the wrong method get 405, anything else 404.
fn route(method: &str, path: &str) -> Route {
    match (method, path) {
        ("GET", "/") | ("GET", "/index.html") => Route::Index,
        ("POST", "/login") => Route::Login,
        ("POST", "/verify") => Route::Verify,
        ("GET", "/dashboard") => Route::Dashboard,
        ("GET", "/api/chart-data") => Route::ChartData,
        ("POST", "/logout") => Route::Logout,
        ("GET", "/qr") => Route::Qr,
        ("GET", "/healthz") => Route::Healthz,
        ("GET", "/readyz") => Route::Readyz,
        ("GET", "/metrics") => Route::Metrics,
        ("GET", "/openapi.json") => Route::OpenApi,
        (_, path) if KNOWN_PATHS.contains(&path) => Route::Rejected(ApiError::MethodNotAllowed),
        _ => Route::Rejected(ApiError::NotFound),
    }
}

/// Probe endpoints bypass the `http` rate-limit scope.
fn is_probe(path: &str) -> bool {
    matches!(path, "/healthz" | "/readyz" | "/metrics")
}

fn append_capped(body: &mut Vec<u8>, chunk: &[u8]) -> Result<(), ApiError> {
    if body.len() + chunk.len() > MAX_BODY_SIZE {
        warn!(
            size = body.len() + chunk.len(),
            max = MAX_BODY_SIZE,
            "request body too large"
        );
        return Err(ApiError::PayloadTooLarge);
    }
    body.extend_from_slice(chunk);
    Ok(())
}

pub struct AppState {
    pub config: ServerConfig,
    pub storage: Arc<Storage>,
    pub store: Arc<dyn ExpenseStore>,
    pub gateway: Arc<GatewayClient>,
    pub login: LoginFlow,
    pub access: Arc<AccessCodeStore>,
    pub sessions: Arc<SessionStore>,
    pub rate_limits: Arc<RateLimiter>,
    pub metrics: Arc<Metrics>,
    pub started_at: Instant,
}

pub struct PoquidaApp {
    pub state: Arc<AppState>,
    http_server_options: HttpServerOptions,
}

fn build_extractor(ai: &AiConfig) -> Result<Arc<dyn IntentExtractor>, ServerError> {
    let Some(api_key) = ai.api_key.clone() else {
        info!("no language model key configured, using keyword intent rules");
        return Ok(Arc::new(KeywordExtractor::new()));
    };
    let mut extractor = LanguageModelExtractor::new(ModelConfig {
        base_url: ai.base_url.clone(),
        model: ai.model.clone(),
        api_key: Some(api_key),
        temperature: ai.temperature,
        timeout: ai.timeout,
    })?;
    if ai.keyword_fallback {
        extractor = extractor.with_fallback(KeywordExtractor::new());
    }
    info!(
        model = extractor.model(),
        base_url = %ai.base_url,
        keyword_fallback = ai.keyword_fallback,
        "language model intent extraction enabled"
    );
    Ok(Arc::new(extractor))
}

impl PoquidaApp {
    pub fn new(state: Arc<AppState>) -> Self {
        PoquidaApp {
            state,
            http_server_options: HttpServerOptions::default(),
        }
    }

    pub async fn init(config: ServerConfig) -> Result<Arc<AppState>, ServerError> {
        let storage = Arc::new(connect(&config.postgres_dsn).await?);
        storage.migrate().await?;
        let metrics = Arc::new(Metrics::new());
        let extractor = build_extractor(&config.ai)?;
        let (gateway, inbound) = GatewayClient::start(
            config.gateway.clone(),
            config.public_url.clone(),
            Arc::clone(&metrics),
        );
        let store: Arc<dyn ExpenseStore> = storage.clone();
        let transport: Arc<dyn ChatTransport> = gateway.clone();
        let access = Arc::new(AccessCodeStore::new(&config.access));
        let sessions = Arc::new(SessionStore::new(config.access.session_ttl));
        let rate_limits = Arc::new(RateLimiter::new(&config.rate_limit));
        let bot = Arc::new(Bot::new(
            Arc::clone(&store),
            Arc::clone(&transport),
            extractor,
            Arc::clone(&access),
            Arc::clone(&metrics),
            SeenSet::new(config.gateway.dedup_window, config.gateway.dedup_capacity),
            config.public_url.clone(),
        ));
        bot.spawn(inbound);
        let login = LoginFlow::new(
            Arc::clone(&access),
            Arc::clone(&sessions),
            transport,
            Arc::clone(&metrics),
            config.access.clone(),
        );
        let state = Arc::new(AppState {
            storage,
            store,
            gateway,
            login,
            access,
            sessions,
            rate_limits,
            metrics,
            started_at: Instant::now(),
            config,
        });

        let cleanup_state = Arc::clone(&state);
        tokio::spawn(async move {
            let mut ticker = interval(cleanup_state.config.access.sweep_interval);
            loop {
                ticker.tick().await;
                let codes = cleanup_state.access.purge_expired().await;
                let sessions = cleanup_state.sessions.purge_expired().await;
                let clients = cleanup_state.rate_limits.purge_idle().await;
                if codes > 0 || sessions > 0 {
                    info!(codes, sessions, "expired access codes and sessions purged");
                }
                if clients > 0 {
                    debug!(clients, "idle rate limit entries purged");
                }
            }
        });
        info!(public_url = %state.config.public_url, "poquida state initialized");
        Ok(state)
    }
}

impl HttpServerApp for PoquidaApp {
    fn process_new_http<'life0, 'life1, 'async_trait>(
        self: &'life0 Arc<Self>,
        session: ServerSession,
        shutdown: &'life1 ShutdownWatch,
    ) -> Pin<Box<dyn Future<Output = Option<ReusedHttpStream>> + Send + 'async_trait>>
    where
        'life0: 'async_trait,
        'life1: 'async_trait,
        Self: 'async_trait,
    {
        Box::pin(async move { self.handle_session(session, shutdown).await })
    }

    fn h2_options(&self) -> Option<H2Options> {
        None
    }

    fn server_options(&self) -> Option<&HttpServerOptions> {
        Some(&self.http_server_options)
    }
}

impl PoquidaApp {
    async fn handle_session(
        self: &Arc<Self>,
        mut session: ServerSession,
        _shutdown: &ShutdownWatch,
    ) -> Option<ReusedHttpStream> {
        match session.read_request().await {
            Ok(true) => {}
            Ok(false) => return None,
            Err(err) => {
                error!("failed to read request: {}", err);
                return None;
            }
        }
        let path = session.req_header().uri.path().to_string();
        let method = session.req_header().method.to_string();
        if !is_probe(&path)
            && let Some(retry_after) = self.check_rate_limit(&session, RateScope::Http).await
        {
            self.state.metrics.mark_http_rate_limited();
            if let Err(err) = self.respond_rate_limited(session, retry_after).await {
                error!("rate limit response failed: {}", err);
            }
            return None;
        }
        self.state.metrics.mark_ingress();

        let result = match route(&method, &path) {
            Route::Index => self.handle_index(&mut session).await,
            Route::Login => self.handle_login(&mut session).await,
            Route::Verify => self.handle_verify(&mut session).await,
            Route::Dashboard => self.handle_dashboard(&mut session).await,
            Route::ChartData => self.handle_chart_data(&mut session).await,
            Route::Logout => self.handle_logout(&mut session).await,
            Route::Qr => self.handle_qr(&mut session).await,
            Route::Healthz => self.handle_healthz(&mut session).await,
            Route::Readyz => self.handle_readyz(&mut session).await,
            Route::Metrics => self.handle_metrics(&mut session).await,
            Route::OpenApi => {
                let body = openapi::openapi_json().as_bytes().to_vec();
                self.write_response(&mut session, 200, "application/json", body, &[])
                    .await
            }
            Route::Rejected(err) => self.respond_api_error(&mut session, err).await,
        };
        if let Err(err) = result {
            error!(path = %path, method = %method, "request handling failed: {}", err);
        }
        None
    }

    async fn handle_index(&self, session: &mut ServerSession) -> Result<(), ServerError> {
        if self.session_jid(session).await.is_some() {
            return self.redirect(session, "/dashboard", None).await;
        }
        self.respond_html(session, 200, &LoginView::blank()).await
    }

    async fn handle_login(&self, session: &mut ServerSession) -> Result<(), ServerError> {
        if let Some(retry_after) = self.check_rate_limit(session, RateScope::Login).await {
            self.state.metrics.mark_http_rate_limited();
            return self.respond_limited_in_place(session, retry_after).await;
        }
        let form = match self.read_form(session).await {
            Ok(form) => form,
            Err(err) => return self.respond_api_error(session, err).await,
        };
        let whatsapp = form.get("whatsapp").map(String::as_str).unwrap_or_default();
        match self.state.login.request_code(whatsapp).await {
            Ok(view) => self.respond_html(session, 200, &view).await,
            Err(view) => self.respond_html(session, 200, &view).await,
        }
    }

    async fn handle_verify(&self, session: &mut ServerSession) -> Result<(), ServerError> {
        if let Some(retry_after) = self.check_rate_limit(session, RateScope::Verify).await {
            self.state.metrics.mark_http_rate_limited();
            return self.respond_limited_in_place(session, retry_after).await;
        }
        let form = match self.read_form(session).await {
            Ok(form) => form,
            Err(err) => return self.respond_api_error(session, err).await,
        };
        let whatsapp = form.get("whatsapp").map(String::as_str).unwrap_or_default();
        let code = form.get("code").map(String::as_str).unwrap_or_default();
        match self.state.login.verify(whatsapp, code).await {
            Ok(token) => {
                let cookie = self.state.sessions.cookie(&token, self.secure_cookies());
                self.redirect(session, "/dashboard", Some(cookie)).await
            }
            Err(view) => self.respond_html(session, 200, &view).await,
        }
    }

    async fn handle_dashboard(&self, session: &mut ServerSession) -> Result<(), ServerError> {
        let Some(jid) = self.session_jid(session).await else {
            return self.redirect(session, "/", None).await;
        };
        let whatsapp = phone_from_jid(&jid);
        let view = match self.state.store.expenses_by_user(&jid).await {
            Ok(expenses) => {
                let stats = ExpenseStats::from_expenses(&expenses);
                DashboardView::build(whatsapp, &expenses, &stats)
            }
            Err(err) => {
                warn!(jid = %jid, error = %err, "dashboard data unavailable");
                DashboardView::unavailable(whatsapp)
            }
        };
        self.respond_html(session, 200, &view).await
    }

    async fn handle_chart_data(&self, session: &mut ServerSession) -> Result<(), ServerError> {
        let Some(jid) = self.session_jid(session).await else {
            return self
                .respond_api_error(
                    session,
                    ApiError::Unauthorized(Some("session required".to_string())),
                )
                .await;
        };
        match self.state.store.expense_stats(&jid).await {
            Ok(stats) => {
                let payload = serde_json::to_value(&stats).map_err(|_| ServerError::Invalid)?;
                self.respond_json(session, 200, payload, "application/json")
                    .await
            }
            Err(err) => {
                warn!(jid = %jid, error = %err, "chart data unavailable");
                self.respond_api_error(session, ApiError::Internal).await
            }
        }
    }

    async fn handle_logout(&self, session: &mut ServerSession) -> Result<(), ServerError> {
        if let Some(token) = Self::session_token(session) {
            self.state.login.logout(&token).await;
        }
        let cookie = SessionStore::clear_cookie(self.secure_cookies());
        self.redirect(session, "/", Some(cookie)).await
    }

    async fn handle_qr(&self, session: &mut ServerSession) -> Result<(), ServerError> {
        match self.state.gateway.qr().await {
            Some(qr) => {
                self.write_response(
                    session,
                    200,
                    "text/plain; charset=utf-8",
                    qr.into_bytes(),
                    &[],
                )
                .await
            }
            None => {
                self.respond_problem(
                    session,
                    404,
                    "NotFound",
                    Some("no pairing QR code pending"),
                )
                .await
            }
        }
    }

    async fn handle_healthz(&self, session: &mut ServerSession) -> Result<(), ServerError> {
        let health = HealthSnapshot {
            status: "healthy".to_string(),
            uptime_seconds: self.state.started_at.elapsed().as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            gateway: self.state.gateway.state().await.to_string(),
            bot_jid: self.state.gateway.own_jid().await,
            counters: self.state.metrics.snapshot(),
        };
        let payload = serde_json::to_value(&health).map_err(|_| ServerError::Invalid)?;
        self.respond_json(session, 200, payload, "application/json")
            .await
    }

    async fn handle_readyz(&self, session: &mut ServerSession) -> Result<(), ServerError> {
        let (status, body) = match self.state.storage.readiness().await {
            Ok(()) => (200, "ready"),
            Err(err) => {
                warn!(error = %err, "readiness probe failed");
                (503, "degraded")
            }
        };
        self.write_response(session, status, "text/plain", body.as_bytes().to_vec(), &[])
            .await
    }

    async fn handle_metrics(&self, session: &mut ServerSession) -> Result<(), ServerError> {
        if !self.authorize_admin(session) {
            return self
                .respond_api_error(session, ApiError::Unauthorized(None))
                .await;
        }
        let payload = self.state.metrics.encode_prometheus();
        self.write_response(
            session,
            200,
            "text/plain; version=0.0.4",
            payload.into_bytes(),
            &[],
        )
        .await
    }

    fn secure_cookies(&self) -> bool {
        self.state.config.tls_enabled() || self.state.config.public_url.starts_with("https://")
    }

    fn session_token(session: &ServerSession) -> Option<String> {
        session
            .req_header()
            .headers
            .get_all("cookie")
            .iter()
            .filter_map(|value| value.to_str().ok())
            .find_map(|header| cookie_value(header, SESSION_COOKIE))
            .map(str::to_string)
    }

    async fn session_jid(&self, session: &ServerSession) -> Option<String> {
        let token = Self::session_token(session)?;
        self.state.sessions.resolve(&token).await
    }

    async fn read_form(
        &self,
        session: &mut ServerSession,
    ) -> Result<std::collections::HashMap<String, String>, ApiError> {
        let body = Self::read_body(session).await?;
        parse_form(&body).map_err(|reason| ApiError::BadRequest(reason.to_string()))
    }

    async fn read_body(session: &mut ServerSession) -> Result<Vec<u8>, ApiError> {
        let mut body = Vec::new();
        loop {
            match session.read_request_body().await {
                Ok(Some(chunk)) => append_capped(&mut body, &chunk)?,
                Ok(None) => break,
                Err(err) => {
                    error!("error reading request body: {}", err);
                    return Err(ApiError::Internal);
                }
            }
        }
        Ok(body)
    }

    fn authorize_admin(&self, session: &ServerSession) -> bool {
        let Some(expected) = self.state.config.admin_token.as_deref() else {
            return true;
        };
        let header = session
            .req_header()
            .headers
            .get("authorization")
            .and_then(|value| value.to_str().ok());
        let Some(bearer) = header.map(str::trim) else {
            return false;
        };
        let token = bearer.strip_prefix("Bearer ").unwrap_or(bearer).trim();
        !token.is_empty() && bool::from(token.as_bytes().ct_eq(expected.as_bytes()))
    }

    fn client_identity(session: &ServerSession) -> String {
        session
            .client_addr()
            .map(|addr| match addr.as_inet() {
                Some(inet) => inet.ip().to_string(),
                None => addr.to_string(),
            })
            .unwrap_or_else(|| "unknown".to_string())
    }

    async fn check_rate_limit(
        &self,
        session: &ServerSession,
        scope: RateScope,
    ) -> Option<StdDuration> {
        let identity = Self::client_identity(session);
        let decision = self.state.rate_limits.check(scope, &identity).await;
        if decision.allowed {
            None
        } else {
            debug!(identity = %identity, scope = ?scope, "request rate limited");
            Some(
                decision
                    .retry_after
                    .unwrap_or_else(|| StdDuration::from_secs(1)),
            )
        }
    }

    async fn write_response(
        &self,
        session: &mut ServerSession,
        status: u16,
        content_type: &str,
        body: Vec<u8>,
        headers: &[(&'static str, String)],
    ) -> Result<(), ServerError> {
        let mut response =
            ResponseHeader::build_no_case(status, None).map_err(|_| ServerError::Invalid)?;
        response
            .append_header("content-type", content_type)
            .map_err(|_| ServerError::Invalid)?;
        response
            .append_header("cache-control", "no-store")
            .map_err(|_| ServerError::Invalid)?;
        for (name, value) in headers {
            response
                .append_header(*name, value.as_str())
                .map_err(|_| ServerError::Invalid)?;
        }
        session
            .write_response_header(Box::new(response))
            .await
            .map_err(|_| ServerError::Io)?;
        session
            .write_response_body(body.into(), true)
            .await
            .map_err(|_| ServerError::Io)?;
        session.finish().await.map_err(|_| ServerError::Io)?;
        self.state.metrics.mark_egress();
        Ok(())
    }

    async fn respond_html<T: Template>(
        &self,
        session: &mut ServerSession,
        status: u16,
        view: &T,
    ) -> Result<(), ServerError> {
        let body = view.render()?;
        self.write_response(
            session,
            status,
            "text/html; charset=utf-8",
            body.into_bytes(),
            &[],
        )
        .await
    }

    async fn redirect(
        &self,
        session: &mut ServerSession,
        location: &str,
        cookie: Option<String>,
    ) -> Result<(), ServerError> {
        let mut headers = vec![("location", location.to_string())];
        if let Some(cookie) = cookie {
            headers.push(("set-cookie", cookie));
        }
        self.write_response(session, 303, "text/plain", Vec::new(), &headers)
            .await
    }

    async fn respond_json(
        &self,
        session: &mut ServerSession,
        status: u16,
        payload: serde_json::Value,
        content_type: &str,
    ) -> Result<(), ServerError> {
        self.write_response(
            session,
            status,
            content_type,
            payload.to_string().into_bytes(),
            &[],
        )
        .await
    }

    async fn respond_api_error(
        &self,
        session: &mut ServerSession,
        error: ApiError,
    ) -> Result<(), ServerError> {
        self.respond_problem(session, error.status(), error.title(), Some(error.detail()))
            .await
    }

    async fn respond_problem(
        &self,
        session: &mut ServerSession,
        status: u16,
        title: &str,
        detail: Option<&str>,
    ) -> Result<(), ServerError> {
        let mut body = json!({
            "type": "about:blank",
            "title": title,
            "status": status,
        });
        if let Some(message) = detail
            && let Some(obj) = body.as_object_mut()
        {
            obj.insert("detail".to_string(), json!(message));
        }
        self.respond_json(session, status, body, "application/problem+json")
            .await
    }

    async fn respond_limited_in_place(
        &self,
        session: &mut ServerSession,
        retry_after: StdDuration,
    ) -> Result<(), ServerError> {
        let body = json!({
            "type": "about:blank",
            "title": "Too Many Requests",
            "status": 429,
        })
        .to_string();
        let retry_secs = retry_after.as_secs().max(1);
        self.write_response(
            session,
            429,
            "application/problem+json",
            body.into_bytes(),
            &[("retry-after", retry_secs.to_string())],
        )
        .await
    }

    async fn respond_rate_limited(
        &self,
        mut session: ServerSession,
        retry_after: StdDuration,
    ) -> Result<(), ServerError> {
        self.respond_limited_in_place(&mut session, retry_after)
            .await
    }
}
