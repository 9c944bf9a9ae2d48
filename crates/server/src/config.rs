use std::collections::HashMap;
use std::env;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

#[derive(Debug)]
pub enum ConfigError {
    Io,
    Parse,
    Missing(&'static str),
    Invalid(&'static str),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io => write!(f, "configuration io failure"),
            Self::Parse => write!(f, "configuration parse failure"),
            Self::Missing(key) => write!(f, "configuration key missing: {}", key),
            Self::Invalid(key) => write!(f, "configuration value invalid: {}", key),
        }
    }
}

impl Error for ConfigError {}

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub url: String,
    pub token: Option<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Zero retries forever.
    pub max_reconnect_attempts: u32,
    pub self_test_delay: Duration,
    pub dedup_window: Duration,
    pub dedup_capacity: usize,
}

#[derive(Clone, Debug)]
pub struct AiConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub timeout: Duration,
    pub keyword_fallback: bool,
}

#[derive(Clone, Debug)]
pub struct AccessConfig {
    pub code_ttl: Duration,
    pub code_length: usize,
    pub max_attempts: u32,
    pub session_ttl: Duration,
    pub delivery_attempts: u32,
    pub delivery_interval: Duration,
    pub sweep_interval: Duration,
}

#[derive(Clone, Debug)]
pub struct RateLimitSettings {
    pub burst: u32,
    pub window: Duration,
    pub penalty: Duration,
}

#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    pub http: RateLimitSettings,
    pub login: RateLimitSettings,
    pub verify: RateLimitSettings,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind: String,
    pub public_url: String,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub postgres_dsn: String,
    pub admin_token: Option<String>,
    pub gateway: GatewayConfig,
    pub ai: AiConfig,
    pub access: AccessConfig,
    pub rate_limit: RateLimitConfig,
}

impl ServerConfig {
    pub fn tls_enabled(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }
}

/// Looks up an override by environment variable name.
pub type EnvLookup<'a> = &'a dyn Fn(&str) -> Result<Option<String>, ConfigError>;

/// Loads server configuration from filesystem and environment overrides.
///
/// A missing file is treated as empty so deployments can configure the
/// process through the environment alone.
pub fn load_configuration(path: &Path) -> Result<ServerConfig, ConfigError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => String::new(),
        Err(_) => return Err(ConfigError::Io),
    };
    parse_configuration(&contents, &process_env)
}

pub fn parse_configuration(contents: &str, env: EnvLookup) -> Result<ServerConfig, ConfigError> {
    let mut map = parse_sections(contents)?;

    let bind = required(
        "server.bind",
        override_env(env, "POQUIDA_BIND", map.remove("server.bind"))?,
    )?;
    let public_url = match override_env(env, "POQUIDA_PUBLIC_URL", map.remove("server.public_url"))? {
        Some(url) => url.trim_end_matches('/').to_string(),
        None => platform_url(env)?.unwrap_or_else(|| format!("http://{}", bind)),
    };
    let tls_cert = override_env(env, "POQUIDA_TLS_CERT", map.remove("server.tls_cert"))?
        .filter(|value| !value.is_empty());
    let tls_key = override_env(env, "POQUIDA_TLS_KEY", map.remove("server.tls_key"))?
        .filter(|value| !value.is_empty());
    if tls_cert.is_some() != tls_key.is_some() {
        return Err(ConfigError::Invalid("server.tls_cert"));
    }
    let postgres_dsn = required(
        "storage.postgres_dsn",
        override_env(env, "POQUIDA_PG_DSN", map.remove("storage.postgres_dsn"))?,
    )?;
    let admin_token = override_env(env, "POQUIDA_ADMIN_TOKEN", map.remove("admin.token"))?
        .filter(|value| !value.is_empty());

    let gateway = GatewayConfig {
        url: required(
            "gateway.url",
            override_env(env, "POQUIDA_GATEWAY_URL", map.remove("gateway.url"))?,
        )?,
        token: override_env(env, "POQUIDA_GATEWAY_TOKEN", map.remove("gateway.token"))?
            .filter(|value| !value.is_empty()),
        connect_timeout: seconds(
            env,
            &mut map,
            "gateway.connect_timeout",
            "POQUIDA_GATEWAY_CONNECT_TIMEOUT",
            10,
        )?,
        request_timeout: seconds(
            env,
            &mut map,
            "gateway.request_timeout",
            "POQUIDA_GATEWAY_REQUEST_TIMEOUT",
            15,
        )?,
        initial_backoff: seconds(
            env,
            &mut map,
            "gateway.initial_backoff",
            "POQUIDA_GATEWAY_INITIAL_BACKOFF",
            5,
        )?,
        max_backoff: seconds(
            env,
            &mut map,
            "gateway.max_backoff",
            "POQUIDA_GATEWAY_MAX_BACKOFF",
            60,
        )?,
        max_reconnect_attempts: number(
            env,
            &mut map,
            "gateway.max_reconnect_attempts",
            "POQUIDA_GATEWAY_MAX_RECONNECTS",
            0,
        )?,
        self_test_delay: seconds(
            env,
            &mut map,
            "gateway.self_test_delay",
            "POQUIDA_GATEWAY_SELF_TEST_DELAY",
            5,
        )?,
        dedup_window: seconds(
            env,
            &mut map,
            "gateway.dedup_window",
            "POQUIDA_DEDUP_WINDOW",
            60,
        )?,
        dedup_capacity: number(
            env,
            &mut map,
            "gateway.dedup_capacity",
            "POQUIDA_DEDUP_CAPACITY",
            10_000,
        )?,
    };

    let ai_key = match override_env(env, "POQUIDA_AI_API_KEY", map.remove("ai.api_key"))? {
        Some(key) => Some(key),
        None => env("GROQ_API_KEY")?,
    };
    let ai = AiConfig {
        api_key: ai_key.filter(|value| !value.is_empty()),
        base_url: override_env(env, "POQUIDA_AI_BASE_URL", map.remove("ai.base_url"))?
            .unwrap_or_else(|| poquida_intent::model::DEFAULT_BASE_URL.to_string()),
        model: override_env(env, "POQUIDA_AI_MODEL", map.remove("ai.model"))?
            .unwrap_or_else(|| poquida_intent::model::DEFAULT_MODEL.to_string()),
        temperature: number(env, &mut map, "ai.temperature", "POQUIDA_AI_TEMPERATURE", 0.2)?,
        timeout: seconds(env, &mut map, "ai.timeout", "POQUIDA_AI_TIMEOUT", 20)?,
        keyword_fallback: flag(
            env,
            &mut map,
            "ai.keyword_fallback",
            "POQUIDA_AI_KEYWORD_FALLBACK",
            true,
        )?,
    };

    let code_length: usize = number(
        env,
        &mut map,
        "access.code_length",
        "POQUIDA_CODE_LENGTH",
        6,
    )?;
    if !(4..=12).contains(&code_length) {
        return Err(ConfigError::Invalid("access.code_length"));
    }
    let sweep_interval = seconds(
        env,
        &mut map,
        "access.sweep_interval",
        "POQUIDA_SWEEP_INTERVAL",
        60,
    )?;
    if sweep_interval.is_zero() {
        return Err(ConfigError::Invalid("access.sweep_interval"));
    }
    let access = AccessConfig {
        code_ttl: seconds(env, &mut map, "access.code_ttl", "POQUIDA_CODE_TTL", 600)?,
        code_length,
        max_attempts: number(
            env,
            &mut map,
            "access.max_attempts",
            "POQUIDA_CODE_MAX_ATTEMPTS",
            5,
        )?,
        session_ttl: seconds(
            env,
            &mut map,
            "access.session_ttl",
            "POQUIDA_SESSION_TTL",
            12 * 60 * 60,
        )?,
        delivery_attempts: number(
            env,
            &mut map,
            "access.delivery_attempts",
            "POQUIDA_DELIVERY_ATTEMPTS",
            3,
        )?,
        delivery_interval: seconds(
            env,
            &mut map,
            "access.delivery_interval",
            "POQUIDA_DELIVERY_INTERVAL",
            2,
        )?,
        sweep_interval,
    };

    let rate_limit = RateLimitConfig {
        http: rate_settings(env, &mut map, "http", (120, 60, 30))?,
        login: rate_settings(env, &mut map, "login", (5, 600, 600))?,
        verify: rate_settings(env, &mut map, "verify", (10, 600, 300))?,
    };

    Ok(ServerConfig {
        bind,
        public_url,
        tls_cert,
        tls_key,
        postgres_dsn,
        admin_token,
        gateway,
        ai,
        access,
        rate_limit,
    })
}

fn parse_sections(contents: &str) -> Result<HashMap<String, String>, ConfigError> {
    let mut section = String::new();
    let mut map = HashMap::new();
    for line in contents.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if trimmed.starts_with('[') && trimmed.ends_with(']') {
            section = trimmed
                .trim_start_matches('[')
                .trim_end_matches(']')
                .to_string();
            continue;
        }
        let parts: Vec<&str> = trimmed.splitn(2, '=').collect();
        if parts.len() != 2 {
            return Err(ConfigError::Parse);
        }
        let key = if section.is_empty() {
            parts[0].trim().to_string()
        } else {
            format!("{}.{}", section, parts[0].trim())
        };
        let mut value = parts[1].trim().to_string();
        if value.starts_with('"') {
            if let Some(end) = value[1..].find('"') {
                value = value[1..=end].to_string();
            } else {
                return Err(ConfigError::Parse);
            }
        } else if let Some(idx) = value.find('#') {
            value.truncate(idx);
            value = value.trim().to_string();
        }
        map.insert(key, value);
    }
    Ok(map)
}

fn process_env(key: &str) -> Result<Option<String>, ConfigError> {
    match env::var(key) {
        Ok(value) => Ok(Some(value)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(_) => Err(ConfigError::Invalid("environment")),
    }
}

fn override_env(
    env: EnvLookup,
    key: &str,
    current: Option<String>,
) -> Result<Option<String>, ConfigError> {
    match env(key)? {
        Some(value) => Ok(Some(value)),
        None => Ok(current),
    }
}

fn required(name: &'static str, value: Option<String>) -> Result<String, ConfigError> {
    value
        .filter(|value| !value.trim().is_empty())
        .ok_or(ConfigError::Missing(name))
}

/// Public hostname injected by the hosting platform, if any.
fn platform_url(env: EnvLookup) -> Result<Option<String>, ConfigError> {
    for key in ["RAILWAY_PUBLIC_DOMAIN", "RAILWAY_STATIC_URL"] {
        if let Some(domain) = env(key)?.filter(|value| !value.trim().is_empty()) {
            let domain = domain
                .trim()
                .trim_start_matches("https://")
                .trim_start_matches("http://")
                .trim_end_matches('/');
            return Ok(Some(format!("https://{}", domain)));
        }
    }
    Ok(None)
}

fn number<T: std::str::FromStr>(
    env: EnvLookup,
    map: &mut HashMap<String, String>,
    name: &'static str,
    env_key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match override_env(env, env_key, map.remove(name))? {
        Some(raw) => raw.trim().parse::<T>().map_err(|_| ConfigError::Invalid(name)),
        None => Ok(default),
    }
}

fn seconds(
    env: EnvLookup,
    map: &mut HashMap<String, String>,
    name: &'static str,
    env_key: &str,
    default: u64,
) -> Result<Duration, ConfigError> {
    number(env, map, name, env_key, default).map(Duration::from_secs)
}

fn flag(
    env: EnvLookup,
    map: &mut HashMap<String, String>,
    name: &'static str,
    env_key: &str,
    default: bool,
) -> Result<bool, ConfigError> {
    match override_env(env, env_key, map.remove(name))? {
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid(name)),
        },
        None => Ok(default),
    }
}

fn rate_settings(
    env: EnvLookup,
    map: &mut HashMap<String, String>,
    scope: &'static str,
    defaults: (u32, u64, u64),
) -> Result<RateLimitSettings, ConfigError> {
    let (burst_key, window_key, penalty_key): (&'static str, &'static str, &'static str) =
        match scope {
            "http" => (
                "limits.http_burst",
                "limits.http_window",
                "limits.http_penalty",
            ),
            "login" => (
                "limits.login_burst",
                "limits.login_window",
                "limits.login_penalty",
            ),
            _ => (
                "limits.verify_burst",
                "limits.verify_window",
                "limits.verify_penalty",
            ),
        };
    let upper = scope.to_ascii_uppercase();
    let burst: u32 = number(
        env,
        map,
        burst_key,
        &format!("POQUIDA_{}_BURST", upper),
        defaults.0,
    )?;
    if burst == 0 {
        return Err(ConfigError::Invalid(burst_key));
    }
    Ok(RateLimitSettings {
        burst,
        window: seconds(
            env,
            map,
            window_key,
            &format!("POQUIDA_{}_WINDOW", upper),
            defaults.1,
        )?,
        penalty: seconds(
            env,
            map,
            penalty_key,
            &format!("POQUIDA_{}_PENALTY", upper),
            defaults.2,
        )?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Result<Option<String>, ConfigError> {
        let values = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        move |key: &str| Ok(values.get(key).cloned())
    }

    const MINIMAL: &str = "[server]\nbind=\"127.0.0.1:8080\"\n[storage]\npostgres_dsn=\"postgres://localhost/poquida\"\n[gateway]\nurl=\"ws://127.0.0.1:3001/ws\" # local bridge\n";

    #[test]
    fn parse_configuration_minimal() {
        let env = env_from(&[]);
        let config = parse_configuration(MINIMAL, &env).unwrap();
        assert_eq!(config.bind, "127.0.0.1:8080");
        assert_eq!(config.public_url, "http://127.0.0.1:8080");
        assert_eq!(config.gateway.url, "ws://127.0.0.1:3001/ws");
        assert_eq!(config.gateway.initial_backoff, Duration::from_secs(5));
        assert_eq!(config.gateway.max_backoff, Duration::from_secs(60));
        assert_eq!(config.gateway.max_reconnect_attempts, 0);
        assert_eq!(config.access.code_ttl, Duration::from_secs(600));
        assert_eq!(config.access.code_length, 6);
        assert_eq!(config.access.max_attempts, 5);
        assert_eq!(config.ai.model, "llama3-8b-8192");
        assert!(config.ai.api_key.is_none());
        assert!(!config.tls_enabled());
    }

    #[test]
    fn environment_overrides_file() {
        let env = env_from(&[
            ("POQUIDA_PG_DSN", "postgres://override/db"),
            ("GROQ_API_KEY", "gsk_test"),
            ("RAILWAY_PUBLIC_DOMAIN", "poquida.up.railway.app"),
            ("POQUIDA_LOGIN_BURST", "2"),
        ]);
        let config = parse_configuration(MINIMAL, &env).unwrap();
        assert_eq!(config.postgres_dsn, "postgres://override/db");
        assert_eq!(config.ai.api_key.as_deref(), Some("gsk_test"));
        assert_eq!(config.public_url, "https://poquida.up.railway.app");
        assert_eq!(config.rate_limit.login.burst, 2);
    }

    #[test]
    fn missing_required_keys_are_named() {
        let env = env_from(&[]);
        let err = parse_configuration("[server]\nbind=\"0.0.0.0:80\"\n", &env).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("storage.postgres_dsn")));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let env = env_from(&[("POQUIDA_CODE_LENGTH", "2")]);
        assert!(matches!(
            parse_configuration(MINIMAL, &env),
            Err(ConfigError::Invalid("access.code_length"))
        ));
        let env = env_from(&[("POQUIDA_TLS_CERT", "cert.pem")]);
        assert!(matches!(
            parse_configuration(MINIMAL, &env),
            Err(ConfigError::Invalid("server.tls_cert"))
        ));
        let env = env_from(&[("POQUIDA_SWEEP_INTERVAL", "0")]);
        assert!(matches!(
            parse_configuration(MINIMAL, &env),
            Err(ConfigError::Invalid("access.sweep_interval"))
        ));
        assert!(matches!(
            parse_configuration("[server]\nbind\n", &env_from(&[])),
            Err(ConfigError::Parse)
        ));
    }

    #[test]
    fn loads_from_file() {
        let mut path = PathBuf::from(env::temp_dir());
        path.push("poquida_test_config.toml");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();
        let config = load_configuration(&path);
        fs::remove_file(&path).unwrap();
        assert!(config.is_ok());
    }
}
