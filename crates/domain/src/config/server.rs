use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_host")]
    pub host: String,
    #[serde(default = "d_port")]
    pub port: u16,
    #[serde(default)]
    pub cors: CorsConfig,
    /// Per-user request budget (leaky bucket), enforced after auth.
    #[serde(default)]
    pub rate_limit: UserRateLimitConfig,
    /// Optional per-IP layer in front of everything, including auth.
    #[serde(default)]
    pub ip_rate_limit: Option<IpRateLimitConfig>,
    #[serde(default = "d_max_concurrent")]
    pub max_concurrent_requests: usize,
    /// How long graceful shutdown waits for in-flight turns to drain.
    #[serde(default = "d_drain_secs")]
    pub shutdown_drain_secs: u64,
    /// Auth token lifetime; `0` means tokens never expire.
    #[serde(default = "d_token_ttl_hours")]
    pub token_ttl_hours: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: d_host(),
            port: d_port(),
            cors: CorsConfig::default(),
            rate_limit: UserRateLimitConfig::default(),
            ip_rate_limit: None,
            max_concurrent_requests: d_max_concurrent(),
            shutdown_drain_secs: d_drain_secs(),
            token_ttl_hours: d_token_ttl_hours(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    /// Origins allowed for CORS. Use `["*"]` for permissive (NOT recommended).
    #[serde(default = "d_cors_origins")]
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: d_cors_origins(),
        }
    }
}

/// Leaky bucket parameters, keyed by `user_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRateLimitConfig {
    #[serde(default = "d_burst")]
    pub burst: u32,
    #[serde(default = "d_per_second")]
    pub requests_per_second: f64,
}

impl Default for UserRateLimitConfig {
    fn default() -> Self {
        Self {
            burst: d_burst(),
            requests_per_second: d_per_second(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpRateLimitConfig {
    pub requests_per_second: u64,
    pub burst_size: u32,
}

// ── serde default helpers ───────────────────────────────────────────

fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_port() -> u16 {
    3210
}
fn d_cors_origins() -> Vec<String> {
    vec!["http://localhost:*".into(), "http://127.0.0.1:*".into()]
}
fn d_max_concurrent() -> usize {
    256
}
fn d_drain_secs() -> u64 {
    20
}
fn d_token_ttl_hours() -> u64 {
    24 * 30
}
fn d_burst() -> u32 {
    10
}
fn d_per_second() -> f64 {
    2.0
}
