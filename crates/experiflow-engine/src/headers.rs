//! Response header helpers: content-type gate, assignment cookie, and the
//! `X-EF-*` observability headers.

use std::time::Duration;

use http::header::{CONTENT_ENCODING, CONTENT_TYPE, SET_COOKIE};
use http::{HeaderMap, HeaderName, HeaderValue};

use crate::orchestrator::AttemptReport;

pub const EXPERIMENT_HEADER: HeaderName = HeaderName::from_static("x-ef-experiment");
pub const VARIANT_HEADER: HeaderName = HeaderName::from_static("x-ef-variant");
pub const TRANSFORM_HEADER: HeaderName = HeaderName::from_static("x-ef-transform");
pub const TIMING_HEADER: HeaderName = HeaderName::from_static("x-ef-timing");

/// Thirty days.
pub const ASSIGNMENT_COOKIE_MAX_AGE: u64 = 30 * 24 * 60 * 60;

/// Whether the response declares an HTML body.
pub fn is_html(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("text/html"))
}

/// Why an HTML response cannot be parsed and re-serialized without damage,
/// or `None` if it can.
///
/// Only identity-encoded UTF-8 bodies are rewritten: anything else would be
/// re-emitted as different bytes under the origin's original headers.
pub fn untransformable_reason(headers: &HeaderMap, body: &[u8]) -> Option<String> {
    if let Some(encoding) = headers.get(CONTENT_ENCODING) {
        let encoding = encoding.to_str().unwrap_or("?");
        let encoded = encoding
            .split(',')
            .map(str::trim)
            .any(|coding| !coding.is_empty() && !coding.eq_ignore_ascii_case("identity"));
        if encoded {
            return Some(format!("content-encoding {encoding}"));
        }
    }
    if let Some(charset) = declared_charset(headers) {
        if !charset.eq_ignore_ascii_case("utf-8") && !charset.eq_ignore_ascii_case("utf8") {
            return Some(format!("charset {charset}"));
        }
    }
    if body.is_empty() {
        return Some("empty body".to_string());
    }
    if let Err(e) = std::str::from_utf8(body) {
        return Some(format!("body is not UTF-8 ({e})"));
    }
    None
}

/// The `charset` parameter of `Content-Type`, unquoted.
fn declared_charset(headers: &HeaderMap) -> Option<String> {
    let content_type = headers.get(CONTENT_TYPE)?.to_str().ok()?;
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        name.trim()
            .eq_ignore_ascii_case("charset")
            .then(|| value.trim().trim_matches('"').to_string())
    })
}

/// Name of the cookie that pins a visitor to a variant of `experiment_id`.
pub fn assignment_cookie_name(experiment_id: &str) -> String {
    format!("ef_var_{experiment_id}")
}

/// `Set-Cookie` value recording a fresh assignment.
pub fn assignment_cookie(experiment_id: &str, variant_id: &str) -> String {
    format!(
        "{}={}; Path=/; Max-Age={}; HttpOnly; SameSite=Lax",
        assignment_cookie_name(experiment_id),
        variant_id,
        ASSIGNMENT_COOKIE_MAX_AGE
    )
}

/// Append a `Set-Cookie` header; existing cookies from the origin are kept.
/// Returns `false` if the value cannot be represented as a header.
pub fn append_assignment_cookie(headers: &mut HeaderMap, experiment_id: &str, variant_id: &str) -> bool {
    match HeaderValue::from_str(&assignment_cookie(experiment_id, variant_id)) {
        Ok(value) => {
            headers.append(SET_COOKIE, value);
            true
        }
        Err(_) => false,
    }
}

fn header_value(value: &str) -> HeaderValue {
    HeaderValue::from_str(value).unwrap_or_else(|_| HeaderValue::from_static(""))
}

/// Overwrite the `X-EF-*` headers with the outcome of one attempt.
pub fn write_observability_headers(headers: &mut HeaderMap, report: &AttemptReport, elapsed: Duration) {
    headers.insert(EXPERIMENT_HEADER, header_value(&report.experiment_id));
    headers.insert(VARIANT_HEADER, header_value(&report.variant_key));
    headers.insert(
        TRANSFORM_HEADER,
        HeaderValue::from_static(report.status.as_str()),
    );
    headers.insert(
        TIMING_HEADER,
        header_value(&format!("total={}ms", elapsed.as_millis())),
    );
}
