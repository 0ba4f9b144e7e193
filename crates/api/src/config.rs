use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_API_KEY: &str = "dev-trustroute-key";
pub const DEFAULT_CHAT_MODEL: &str = "qwen/qwen-2.5-72b-instruct";
const DEFAULT_SESSION_TTL_SECONDS: u64 = 60 * 60 * 24 * 7;
const MIN_BCRYPT_COST: u32 = 4;
const MAX_BCRYPT_COST: u32 = 31;

/// Runtime settings for the HTTP service, read once from `TRUSTROUTE_*`.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub bind: String,
    /// `None` or `"memory"` keeps everything in process.
    pub database_url: Option<String>,
    pub api_key: String,
    pub session_ttl: Duration,
    pub cookie_name: String,
    pub cookie_domain: Option<String>,
    pub cookie_secure: bool,
    pub cookie_same_site: String,
    pub allowed_origins: Vec<String>,
    pub api_rate_limit_window: Duration,
    pub api_rate_limit_max: usize,
    pub auth_rate_limit_window: Duration,
    pub auth_rate_limit_max: usize,
    pub openrouter_api_key: Option<String>,
    pub chat_model: String,
    pub policy_doc: Option<PathBuf>,
    pub bcrypt_cost: u32,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            database_url: None,
            api_key: DEFAULT_API_KEY.to_string(),
            session_ttl: Duration::from_secs(DEFAULT_SESSION_TTL_SECONDS),
            cookie_name: "trustroute_session".to_string(),
            cookie_domain: None,
            cookie_secure: true,
            cookie_same_site: "lax".to_string(),
            allowed_origins: default_allowed_origins(),
            api_rate_limit_window: Duration::from_secs(60),
            api_rate_limit_max: 80,
            auth_rate_limit_window: Duration::from_secs(60),
            auth_rate_limit_max: 12,
            openrouter_api_key: None,
            chat_model: DEFAULT_CHAT_MODEL.to_string(),
            policy_doc: None,
            bcrypt_cost: 10,
        }
    }
}

impl ApiConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            bind: non_empty_var("TRUSTROUTE_BIND").unwrap_or(defaults.bind),
            database_url: non_empty_var("TRUSTROUTE_DATABASE_URL"),
            api_key: non_empty_var("TRUSTROUTE_API_KEY").unwrap_or(defaults.api_key),
            session_ttl: parsed_var::<u64>("TRUSTROUTE_SESSION_TTL_SECONDS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.session_ttl),
            cookie_name: non_empty_var("TRUSTROUTE_SESSION_COOKIE_NAME")
                .unwrap_or(defaults.cookie_name),
            cookie_domain: non_empty_var("TRUSTROUTE_SESSION_COOKIE_DOMAIN"),
            cookie_secure: non_empty_var("TRUSTROUTE_COOKIE_SECURE")
                .map(|value| !matches!(value.to_ascii_lowercase().as_str(), "0" | "false" | "no"))
                .unwrap_or(defaults.cookie_secure),
            cookie_same_site: sanitize_enum_value(
                non_empty_var("TRUSTROUTE_COOKIE_SAMESITE")
                    .unwrap_or(defaults.cookie_same_site)
                    .as_str(),
                &["strict", "lax", "none"],
                "lax",
            ),
            allowed_origins: non_empty_var("TRUSTROUTE_ALLOWED_ORIGINS")
                .map(|value| parse_allowed_origins(&value))
                .unwrap_or(defaults.allowed_origins),
            api_rate_limit_window: parsed_var::<u64>("TRUSTROUTE_API_RATE_LIMIT_WINDOW_SECONDS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.api_rate_limit_window),
            api_rate_limit_max: parsed_var("TRUSTROUTE_API_RATE_LIMIT_MAX")
                .unwrap_or(defaults.api_rate_limit_max),
            auth_rate_limit_window: parsed_var::<u64>("TRUSTROUTE_AUTH_RATE_LIMIT_WINDOW_SECONDS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.auth_rate_limit_window),
            auth_rate_limit_max: parsed_var("TRUSTROUTE_AUTH_RATE_LIMIT_MAX")
                .unwrap_or(defaults.auth_rate_limit_max),
            openrouter_api_key: non_empty_var("OPENROUTER_API_KEY"),
            chat_model: non_empty_var("TRUSTROUTE_CHAT_MODEL").unwrap_or(defaults.chat_model),
            policy_doc: non_empty_var("TRUSTROUTE_POLICY_DOC").map(PathBuf::from),
            bcrypt_cost: parsed_var::<u32>("TRUSTROUTE_BCRYPT_COST")
                .map(|cost| cost.clamp(MIN_BCRYPT_COST, MAX_BCRYPT_COST))
                .unwrap_or(defaults.bcrypt_cost),
        }
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parsed_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    non_empty_var(name).and_then(|value| value.parse::<T>().ok())
}

fn default_allowed_origins() -> Vec<String> {
    [
        "http://localhost:3000",
        "http://127.0.0.1:3000",
        "http://localhost:5500",
        "http://127.0.0.1:5500",
    ]
    .iter()
    .map(|value| value.to_string())
    .collect()
}

/// Comma-separated origins, trailing slashes dropped.
pub fn parse_allowed_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|origin| origin.trim().trim_end_matches('/').to_string())
        .filter(|origin| !origin.is_empty())
        .collect()
}

pub fn sanitize_enum_value(value: &str, allowed: &[&str], default: &str) -> String {
    let normalized = value.trim().to_ascii_lowercase();
    if allowed.contains(&normalized.as_str()) {
        normalized
    } else {
        default.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origins_are_trimmed_and_blank_entries_dropped() {
        assert_eq!(
            parse_allowed_origins(" https://trustroute.in/ , ,http://localhost:3000"),
            vec!["https://trustroute.in", "http://localhost:3000"]
        );
    }

    #[test]
    fn unknown_same_site_falls_back() {
        assert_eq!(sanitize_enum_value("STRICT", &["strict", "lax"], "lax"), "strict");
        assert_eq!(sanitize_enum_value("sideways", &["strict", "lax"], "lax"), "lax");
    }

    #[test]
    fn defaults_match_local_development() {
        let config = ApiConfig::default();
        assert_eq!(config.session_ttl, Duration::from_secs(604_800));
        assert_eq!(config.cookie_name, "trustroute_session");
        assert!(config.database_url.is_none());
        assert!(config
            .allowed_origins
            .iter()
            .any(|origin| origin == "http://localhost:3000"));
    }
}
