//! Configuration module for environment variable parsing.
//!
//! Both binaries read the same variables so the dispatcher and the web
//! server agree on the database and on the public tracking base URL.

use std::env;
use std::time::Duration;
use tracing::warn;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection URL
    pub database_url: String,

    /// Port for the tracking web server to listen on
    pub port: u16,

    /// Public base URL that tracking links and pixels point at
    pub phish_base_url: String,

    /// Seconds between scheduler ticks
    pub scheduler_interval_secs: u64,

    /// Default cap on simultaneous sends per sending profile
    pub send_concurrency: usize,

    /// Timeout applied to each SMTP network operation in milliseconds
    pub smtp_timeout_ms: u64,

    /// Name announced in EHLO
    pub smtp_helo_name: String,

    /// Where form submissions land when the landing page sets no redirect
    pub submit_redirect_url: String,

    /// Optional list of hosts click redirects may target
    pub redirect_allow_domains: Option<Vec<String>>,

    /// Whether to take the client address from X-Forwarded-For
    pub trust_proxy_headers: bool,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Config {
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://lure.db".to_string()),

            port: env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8080),

            phish_base_url: env::var("PHISH_BASE_URL")
                .map(|v| v.trim_end_matches('/').to_string())
                .unwrap_or_else(|_| "http://localhost:8080".to_string()),

            scheduler_interval_secs: parse_positive("SCHEDULER_INTERVAL_SECS", 60),

            send_concurrency: parse_positive("SEND_CONCURRENCY", 10) as usize,

            smtp_timeout_ms: parse_positive("SMTP_TIMEOUT_MS", 30_000),

            smtp_helo_name: env::var("SMTP_HELO_NAME").unwrap_or_else(|_| "localhost".to_string()),

            submit_redirect_url: env::var("SUBMIT_REDIRECT_URL")
                .unwrap_or_else(|_| "https://example.com/".to_string()),

            redirect_allow_domains: parse_csv("REDIRECT_DOMAIN_ALLOWLIST"),

            trust_proxy_headers: env::var("TRUST_PROXY_HEADERS")
                .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
        }
    }

    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler_interval_secs)
    }

    pub fn smtp_timeout(&self) -> Duration {
        Duration::from_millis(self.smtp_timeout_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            database_url: "sqlite::memory:".to_string(),
            port: 8080,
            phish_base_url: "http://localhost:8080".to_string(),
            scheduler_interval_secs: 60,
            send_concurrency: 10,
            smtp_timeout_ms: 30_000,
            smtp_helo_name: "localhost".to_string(),
            submit_redirect_url: "https://example.com/".to_string(),
            redirect_allow_domains: None,
            trust_proxy_headers: false,
        }
    }
}

/// Parse a strictly positive integer, falling back to the default otherwise.
fn parse_positive(name: &str, default: u64) -> u64 {
    let raw = match env::var(name) {
        Ok(v) => v,
        Err(_) => return default,
    };

    match raw.trim().parse::<u64>() {
        Ok(v) if v > 0 => v,
        _ => {
            warn!(env_var = name, value = %raw, "Invalid positive integer, using default");
            default
        }
    }
}

/// Parse a comma-separated list of strings.
fn parse_csv(name: &str) -> Option<Vec<String>> {
    env::var(name).ok().map(|raw| {
        raw.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
}
