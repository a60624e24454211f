use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";

/// HTTP client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Maximum requests in flight across all hosts.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Maximum requests in flight per host.
    #[serde(default = "default_per_host")]
    pub per_host: usize,

    /// Per-request timeout, in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: f64,

    /// Extra headers merged into every request.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Per-host proxy URLs.
    #[serde(default)]
    pub proxies: HashMap<String, String>,

    /// Politeness policy; adaptive when unset.
    #[serde(default)]
    pub throttle: Option<ThrottleConfig>,
}

/// Serializable throttle selection, realized as an
/// [`http::Throttle`](crate::http::Throttle) at client start.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ThrottleConfig {
    /// Adaptive delay derived from observed latency.
    Auto,
    /// Fixed delay in seconds before every request.
    Delay(f64),
    /// No delay at all.
    Off,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            concurrency: default_concurrency(),
            per_host: default_per_host(),
            timeout: default_timeout(),
            headers: HashMap::new(),
            proxies: HashMap::new(),
            throttle: None,
        }
    }
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

fn default_concurrency() -> usize {
    16
}

fn default_per_host() -> usize {
    8
}

fn default_timeout() -> f64 {
    15.0
}

/// Engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    #[serde(default)]
    pub client: ClientConfig,

    /// Consult robots.txt before submitting fetches. Off by default.
    #[serde(default)]
    pub respect_robots: bool,
}
