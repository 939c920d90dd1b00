//! Per-request visitor inputs extracted from inbound headers.

use std::net::IpAddr;

use http::header::{COOKIE, USER_AGENT};
use http::HeaderMap;

/// Everything the orchestrator needs to know about the visitor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VisitorContext {
    cookies: Vec<(String, String)>,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
}

impl VisitorContext {
    /// Build from inbound request headers and the socket peer address.
    ///
    /// The client IP is the first `X-Forwarded-For` entry when present,
    /// otherwise the peer address (no port).
    pub fn from_headers(headers: &HeaderMap, peer: Option<IpAddr>) -> Self {
        let cookies = headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(parse_cookie_header)
            .collect();

        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|ip| !ip.is_empty())
            .map(String::from);

        let user_agent = headers
            .get(USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .filter(|ua| !ua.is_empty())
            .map(String::from);

        Self {
            cookies,
            client_ip: forwarded.or_else(|| peer.map(|ip| ip.to_string())),
            user_agent,
        }
    }

    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.push((name.into(), value.into()));
        self
    }

    /// Value of the first cookie called `name`.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Split a `Cookie` header into name/value pairs. Malformed pairs are skipped.
fn parse_cookie_header(header: &str) -> Vec<(String, String)> {
    header
        .split(';')
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value);
            Some((name.to_string(), value.to_string()))
        })
        .collect()
}
