mod app;
mod config;
mod metrics;
mod openapi;
mod security;
mod transport;
mod util;

use app::PoquidaApp;
use pingora::listeners::tls::TlsSettings;
use pingora::server::Server;
use pingora::services::listening::Service;
use std::env;
use std::path::Path;
use std::sync::Arc;
use tokio::runtime::Builder;
use tracing::{info, warn};

fn main() {
    let dotenv = dotenvy::dotenv();
    let log_filter = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .json()
        .init();
    if let Err(err) = dotenv
        && !err.not_found()
    {
        warn!(error = %err, "failed to load .env file");
    }

    let config_path = env::var("POQUIDA_CONFIG").unwrap_or_else(|_| "poquida.toml".to_string());
    let config = config::load_configuration(Path::new(&config_path)).expect("configuration");

    let runtime = Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("runtime");
    let state = runtime.block_on(PoquidaApp::init(config)).expect("state");

    let bind_addr = state.config.bind.clone();
    let app = PoquidaApp::new(Arc::clone(&state));
    let mut service = Service::new("Poquida".to_string(), app);
    match (&state.config.tls_cert, &state.config.tls_key) {
        (Some(cert_path), Some(key_path)) => {
            let mut tls = TlsSettings::intermediate(cert_path, key_path).expect("tls");
            tls.enable_h2();
            service.add_tls_with_settings(&bind_addr, None, tls);
        }
        _ => service.add_tcp(&bind_addr),
    }

    let mut server = Server::new(None).expect("server");
    server.add_service(service);
    server.bootstrap();
    info!(
        address = %bind_addr,
        tls = state.config.tls_enabled(),
        public_url = %state.config.public_url,
        "poquida listening"
    );
    server.run_forever();
}
