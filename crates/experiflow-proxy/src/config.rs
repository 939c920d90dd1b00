//! Command-line and environment configuration.

use std::time::Duration;

use clap::builder::BoolishValueParser;
use clap::Parser;
use url::Url;

use experiflow_engine::OrchestratorConfig;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "experiflow-proxy",
    version,
    about = "Reverse proxy that applies A/B experiment transforms to HTML responses"
)]
pub struct Cli {
    /// Port to listen on
    #[arg(long, env = "PORT", default_value_t = 8090)]
    pub port: u16,

    /// Origin server to proxy to
    #[arg(long, env = "ORIGIN_URL", default_value = "http://localhost:8080", value_parser = parse_origin_url)]
    pub origin_url: Url,

    /// Longest wait for each chunk of the inbound request body (e.g. 10s, 500ms)
    #[arg(long, env = "READ_TIMEOUT", default_value = "10s", value_parser = parse_duration)]
    pub read_timeout: Duration,

    /// Timeout for the whole request, origin round trip included
    #[arg(long, env = "WRITE_TIMEOUT", default_value = "10s", value_parser = parse_duration)]
    pub write_timeout: Duration,

    /// Base URL of the experiment service
    #[arg(long, env = "EXPERIFLOW_API_URL", default_value = "http://localhost:8000")]
    pub api_url: String,

    /// Bearer token for transform-spec requests
    #[arg(long, env = "EXPERIFLOW_EDGE_TOKEN", hide_env_values = true)]
    pub edge_token: Option<String>,

    /// Per-experiment budget covering variant lookup, spec fetch and transform
    #[arg(long, env = "TRANSFORM_TIMEOUT", default_value = "50ms", value_parser = parse_duration)]
    pub transform_timeout: Duration,

    /// Secret salt for visitor bucketing
    #[arg(long, env = "EXPERIFLOW_SALT", hide_env_values = true)]
    pub salt: String,

    /// Comma-separated experiment ids, applied in the order given
    #[arg(long, env = "EXPERIMENT_IDS", default_value = "")]
    pub experiment_ids: String,

    /// Cookie that carries a stable visitor id, if the site sets one
    #[arg(long, env = "EXPERIFLOW_USER_ID_COOKIE")]
    pub user_id_cookie: Option<String>,

    /// Log experiment attempts at info level (otherwise debug)
    #[arg(long, env = "ENABLE_LOGGING", default_value = "true", value_parser = BoolishValueParser::new(), action = clap::ArgAction::Set)]
    pub enable_logging: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    /// Configured experiment ids in order, blanks and repeats removed.
    pub fn experiments(&self) -> Vec<String> {
        parse_experiment_ids(&self.experiment_ids)
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            experiment_ids: self.experiments(),
            transform_timeout: self.transform_timeout,
            user_id_cookie: self.user_id_cookie.clone().filter(|c| !c.is_empty()),
            enable_logging: self.enable_logging,
        }
    }
}

/// Split a comma-separated id list. The first occurrence of an id wins.
pub fn parse_experiment_ids(input: &str) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    for id in input.split(',').map(str::trim).filter(|id| !id.is_empty()) {
        if !ids.iter().any(|existing| existing == id) {
            ids.push(id.to_string());
        }
    }
    ids
}

/// Parse `<n>ms`, `<n>s`, `<n>m` or `<n>h`.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    let (digits, unit_ms) = if let Some(val) = s.strip_suffix("ms") {
        (val, 1)
    } else if let Some(val) = s.strip_suffix('s') {
        (val, 1_000)
    } else if let Some(val) = s.strip_suffix('m') {
        (val, 60_000)
    } else if let Some(val) = s.strip_suffix('h') {
        (val, 3_600_000)
    } else {
        return Err(format!("unknown duration format: '{input}' (expected e.g. 50ms, 10s, 5m, 1h)"));
    };
    let n: u64 = digits
        .trim()
        .parse()
        .map_err(|e| format!("invalid duration '{input}': {e}"))?;
    n.checked_mul(unit_ms)
        .map(Duration::from_millis)
        .ok_or_else(|| format!("duration '{input}' is too large"))
}

/// Accept only absolute http(s) URLs with a host.
pub fn parse_origin_url(input: &str) -> Result<Url, String> {
    let url = Url::parse(input).map_err(|e| format!("invalid origin URL '{input}': {e}"))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(format!("origin URL must be http or https, got '{}'", url.scheme()));
    }
    if url.host_str().is_none() {
        return Err(format!("origin URL '{input}' has no host"));
    }
    Ok(url)
}
