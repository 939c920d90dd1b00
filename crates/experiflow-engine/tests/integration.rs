use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, SET_COOKIE};
use http::{HeaderMap, HeaderValue};

use experiflow_assign::Assigner;
use experiflow_client::ExperimentSource;
use experiflow_engine::{Orchestrator, OrchestratorConfig, ProxiedResponse, VisitorContext};
use experiflow_types::{
    ExperiflowError, Operation, OperationKind, Result, TransformSpec, TransformStatus, Variant,
};

const SALT: &str = "integration-salt";
const PAGE: &str = r#"<!DOCTYPE html><html><head><title>Shop</title></head><body><button id="cta">Get Started</button></body></html>"#;

// ---------------------------------------------------------------------------
// Mock experiment service
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MockSource {
    variants: HashMap<String, Vec<Variant>>,
    operations: HashMap<(String, String), Vec<Operation>>,
    variants_delay: Option<Duration>,
    spec_delay: Option<Duration>,
    fail_specs: bool,
    variant_calls: AtomicUsize,
    spec_calls: AtomicUsize,
}

impl MockSource {
    fn with_variants(mut self, experiment: &str, variants: Vec<Variant>) -> Self {
        self.variants.insert(experiment.into(), variants);
        self
    }

    fn with_operations(mut self, experiment: &str, variant: &str, ops: Vec<Operation>) -> Self {
        self.operations.insert((experiment.into(), variant.into()), ops);
        self
    }
}

#[async_trait]
impl ExperimentSource for MockSource {
    async fn variants(&self, experiment_id: &str) -> Result<Vec<Variant>> {
        self.variant_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.variants_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.variants.get(experiment_id).cloned().unwrap_or_default())
    }

    async fn transform_spec(&self, experiment_id: &str, variant_id: &str) -> Result<TransformSpec> {
        self.spec_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.spec_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_specs {
            return Err(ExperiflowError::Api {
                endpoint: "transform-spec".into(),
                status: 500,
                message: "boom".into(),
            });
        }
        Ok(TransformSpec {
            version: "1".into(),
            experiment_id: experiment_id.into(),
            variant_id: variant_id.into(),
            variant_key: format!("key-{variant_id}"),
            operations: self
                .operations
                .get(&(experiment_id.to_string(), variant_id.to_string()))
                .cloned()
                .unwrap_or_default(),
            ..Default::default()
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn variant(id: &str, name: &str, allocation: f64) -> Variant {
    Variant {
        id: id.into(),
        name: name.into(),
        is_control: name == "control",
        traffic_allocation: allocation,
    }
}

fn set_cta(value: &str) -> Vec<Operation> {
    vec![Operation::new(OperationKind::SetText, "#cta", value)]
}

fn single_variant_source(experiment: &str, ops: Vec<Operation>) -> MockSource {
    MockSource::default()
        .with_variants(experiment, vec![variant("v-1", "treatment", 1.0)])
        .with_operations(experiment, "v-1", ops)
}

fn build(source: Arc<MockSource>, experiments: &[&str], timeout: Duration) -> Orchestrator {
    Orchestrator::new(
        OrchestratorConfig {
            experiment_ids: experiments.iter().map(|e| e.to_string()).collect(),
            transform_timeout: timeout,
            user_id_cookie: Some("uid".into()),
            enable_logging: true,
        },
        Assigner::new(SALT).unwrap(),
        source,
    )
}

fn html_response(body: &str) -> ProxiedResponse {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/html; charset=utf-8"));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
    ProxiedResponse {
        headers,
        body: Bytes::copy_from_slice(body.as_bytes()),
    }
}

fn visitor() -> VisitorContext {
    let mut headers = HeaderMap::new();
    headers.insert("user-agent", HeaderValue::from_static("Mozilla/5.0 (test)"));
    VisitorContext::from_headers(&headers, Some("198.51.100.4".parse().unwrap()))
}

fn header<'a>(resp: &'a ProxiedResponse, name: &str) -> &'a str {
    resp.headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

fn set_cookies(resp: &ProxiedResponse) -> Vec<String> {
    resp.headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok().map(String::from))
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn fresh_visitor_gets_transformed_page_and_cookie() {
    let source = Arc::new(single_variant_source("exp-1", set_cta("Buy Now")));
    let orch = build(source.clone(), &["exp-1"], Duration::from_secs(5));
    let mut resp = html_response(PAGE);

    let reports = orch.modify_response(&visitor(), &mut resp).await;

    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].status, TransformStatus::Hit);
    assert!(reports[0].new_assignment);
    let body = std::str::from_utf8(&resp.body).unwrap();
    assert!(body.contains(r#"<button id="cta">Buy Now</button>"#));
    assert_eq!(header(&resp, "content-length"), resp.body.len().to_string());

    assert_eq!(header(&resp, "x-ef-experiment"), "exp-1");
    assert_eq!(header(&resp, "x-ef-variant"), "treatment");
    assert_eq!(header(&resp, "x-ef-transform"), "hit");
    let timing = header(&resp, "x-ef-timing");
    assert!(timing.starts_with("total=") && timing.ends_with("ms"), "{timing}");

    assert_eq!(
        set_cookies(&resp),
        vec!["ef_var_exp-1=v-1; Path=/; Max-Age=2592000; HttpOnly; SameSite=Lax".to_string()]
    );
    assert_eq!(source.variant_calls.load(Ordering::SeqCst), 1);
    assert_eq!(source.spec_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn returning_visitor_skips_variant_fetch() {
    let source = Arc::new(
        MockSource::default().with_operations("exp-1", "v-2", set_cta("Welcome back")),
    );
    let orch = build(source.clone(), &["exp-1"], Duration::from_secs(5));
    let visitor = visitor().with_cookie("ef_var_exp-1", "v-2");
    let mut resp = html_response(PAGE);

    let reports = orch.modify_response(&visitor, &mut resp).await;

    assert_eq!(reports[0].status, TransformStatus::Hit);
    assert!(!reports[0].new_assignment);
    assert_eq!(reports[0].variant_id, "v-2");
    assert_eq!(header(&resp, "x-ef-variant"), "key-v-2");
    assert!(set_cookies(&resp).is_empty());
    assert_eq!(source.variant_calls.load(Ordering::SeqCst), 0);
    assert!(std::str::from_utf8(&resp.body).unwrap().contains("Welcome back"));
}

#[tokio::test]
async fn empty_cookie_value_triggers_assignment() {
    let source = Arc::new(single_variant_source("exp-1", set_cta("Buy Now")));
    let orch = build(source.clone(), &["exp-1"], Duration::from_secs(5));
    let visitor = visitor().with_cookie("ef_var_exp-1", "");
    let mut resp = html_response(PAGE);

    let reports = orch.modify_response(&visitor, &mut resp).await;

    assert!(reports[0].new_assignment);
    assert_eq!(source.variant_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn control_spec_leaves_body_untouched() {
    let source = Arc::new(single_variant_source("exp-1", Vec::new()));
    let orch = build(source, &["exp-1"], Duration::from_secs(5));
    let mut resp = html_response(PAGE);

    let reports = orch.modify_response(&visitor(), &mut resp).await;

    assert_eq!(reports[0].status, TransformStatus::Control);
    assert_eq!(&resp.body[..], PAGE.as_bytes());
    assert_eq!(header(&resp, "x-ef-transform"), "control");
    assert_eq!(header(&resp, "content-length"), PAGE.len().to_string());
}

#[tokio::test]
async fn spec_failure_fails_open_with_miss() {
    let mut source = single_variant_source("exp-1", set_cta("Buy Now"));
    source.fail_specs = true;
    let orch = build(Arc::new(source), &["exp-1"], Duration::from_secs(5));
    let mut resp = html_response(PAGE);

    let reports = orch.modify_response(&visitor(), &mut resp).await;

    assert_eq!(reports[0].status, TransformStatus::Miss);
    assert!(reports[0].error.as_deref().unwrap_or_default().contains("500"));
    assert_eq!(&resp.body[..], PAGE.as_bytes());
    assert_eq!(header(&resp, "x-ef-transform"), "miss");
    // The assignment was made before the spec fetch failed.
    assert_eq!(set_cookies(&resp).len(), 1);
}

#[tokio::test]
async fn slow_spec_fetch_times_out_with_original_body() {
    let mut source = single_variant_source("exp-1", set_cta("Buy Now"));
    source.spec_delay = Some(Duration::from_secs(2));
    let orch = build(Arc::new(source), &["exp-1"], Duration::from_millis(50));
    let mut resp = html_response(PAGE);

    let reports = orch.modify_response(&visitor(), &mut resp).await;

    assert_eq!(reports[0].status, TransformStatus::Timeout);
    assert_eq!(&resp.body[..], PAGE.as_bytes());
    assert_eq!(header(&resp, "x-ef-transform"), "timeout");
}

#[tokio::test]
async fn deadline_is_shared_across_stages() {
    // Each call alone fits in the budget; together they do not.
    let mut source = single_variant_source("exp-1", set_cta("Buy Now"));
    source.variants_delay = Some(Duration::from_millis(150));
    source.spec_delay = Some(Duration::from_millis(150));
    let orch = build(Arc::new(source), &["exp-1"], Duration::from_millis(250));
    let mut resp = html_response(PAGE);

    let reports = orch.modify_response(&visitor(), &mut resp).await;

    assert_eq!(reports[0].status, TransformStatus::Timeout);
    assert_eq!(&resp.body[..], PAGE.as_bytes());
}

#[tokio::test]
async fn slow_variant_fetch_emits_no_cookie() {
    let mut source = single_variant_source("exp-1", set_cta("Buy Now"));
    source.variants_delay = Some(Duration::from_secs(2));
    let source = Arc::new(source);
    let orch = build(source.clone(), &["exp-1"], Duration::from_millis(50));
    let mut resp = html_response(PAGE);

    let reports = orch.modify_response(&visitor(), &mut resp).await;

    assert_eq!(reports[0].status, TransformStatus::Timeout);
    assert!(set_cookies(&resp).is_empty());
    assert_eq!(source.spec_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn empty_variant_list_is_a_miss_without_cookie() {
    let source = Arc::new(MockSource::default());
    let orch = build(source.clone(), &["exp-1"], Duration::from_secs(5));
    let mut resp = html_response(PAGE);

    let reports = orch.modify_response(&visitor(), &mut resp).await;

    assert_eq!(reports[0].status, TransformStatus::Miss);
    assert!(set_cookies(&resp).is_empty());
    assert_eq!(header(&resp, "x-ef-variant"), "");
    assert_eq!(source.spec_calls.load(Ordering::SeqCst), 0);
    assert_eq!(&resp.body[..], PAGE.as_bytes());
}

#[tokio::test]
async fn non_html_response_is_not_attempted() {
    let source = Arc::new(single_variant_source("exp-1", set_cta("Buy Now")));
    let orch = build(source.clone(), &["exp-1"], Duration::from_secs(5));
    let mut resp = html_response(r#"{"ok":true}"#);
    resp.headers
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    let reports = orch.modify_response(&visitor(), &mut resp).await;

    assert!(reports.is_empty());
    assert!(resp.headers.get("x-ef-transform").is_none());
    assert_eq!(source.variant_calls.load(Ordering::SeqCst), 0);
    assert_eq!(&resp.body[..], br#"{"ok":true}"#);
}

#[tokio::test]
async fn compressed_html_is_left_alone() {
    let source = Arc::new(single_variant_source("exp-1", set_cta("Buy Now")));
    let orch = build(source.clone(), &["exp-1"], Duration::from_secs(5));
    let gzipped: &[u8] = &[0x1f, 0x8b, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x03];
    let mut resp = html_response(PAGE);
    resp.body = Bytes::from_static(gzipped);
    resp.headers
        .insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));

    let reports = orch.modify_response(&visitor(), &mut resp).await;

    assert_eq!(reports[0].status, TransformStatus::Miss);
    assert_eq!(header(&resp, "x-ef-transform"), "miss");
    assert_eq!(header(&resp, "content-encoding"), "gzip");
    assert_eq!(&resp.body[..], gzipped);
    assert!(set_cookies(&resp).is_empty());
    assert_eq!(source.variant_calls.load(Ordering::SeqCst), 0);
    assert_eq!(source.spec_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn latin1_html_keeps_its_bytes() {
    let source = Arc::new(single_variant_source("exp-1", set_cta("Buy Now")));
    let orch = build(source.clone(), &["exp-1"], Duration::from_secs(5));
    let page: &[u8] = b"<html><body><p>caf\xe9</p><button id=\"cta\">Go</button></body></html>";
    let mut resp = html_response(PAGE);
    resp.body = Bytes::from_static(page);
    resp.headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=iso-8859-1"),
    );

    let reports = orch.modify_response(&visitor(), &mut resp).await;

    assert_eq!(reports[0].status, TransformStatus::Miss);
    assert_eq!(&resp.body[..], page);
    assert_eq!(source.variant_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn undeclared_non_utf8_body_is_a_miss() {
    let source = Arc::new(single_variant_source("exp-1", set_cta("Buy Now")));
    let orch = build(source, &["exp-1"], Duration::from_secs(5));
    let page: &[u8] = b"<p>caf\xe9</p><button id=\"cta\">Go</button>";
    let mut resp = html_response(PAGE);
    resp.body = Bytes::from_static(page);
    resp.headers
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/html"));

    let reports = orch.modify_response(&visitor(), &mut resp).await;

    assert_eq!(reports[0].status, TransformStatus::Miss);
    assert!(reports[0]
        .error
        .as_deref()
        .is_some_and(|e| e.contains("not UTF-8")));
    assert_eq!(&resp.body[..], page);
}

#[tokio::test]
async fn slow_transform_times_out_with_original_body() {
    // Instant collaborators; the parse of a page this size alone overruns the budget.
    let ops = vec![Operation::new(OperationKind::SetText, ".item", "changed")];
    let source = Arc::new(single_variant_source("exp-1", ops));
    let orch = build(source.clone(), &["exp-1"], Duration::from_millis(10));
    let page = format!(
        "<html><body>{}</body></html>",
        r#"<div class="item"><span>entry</span></div>"#.repeat(50_000)
    );
    let mut resp = html_response(&page);

    let reports = orch.modify_response(&visitor(), &mut resp).await;

    assert_eq!(reports[0].status, TransformStatus::Timeout);
    assert!(reports[0]
        .error
        .as_deref()
        .is_some_and(|e| e.contains("transforming document")));
    assert_eq!(&resp.body[..], page.as_bytes());
    assert_eq!(header(&resp, "content-length"), page.len().to_string());
    assert_eq!(source.spec_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failing_operation_does_not_block_the_rest() {
    let ops = vec![
        Operation::new(OperationKind::SetStyle, ".missing", "none").with_property("display"),
        Operation::new(OperationKind::SetText, "#cta", "Buy Now"),
    ];
    let source = Arc::new(single_variant_source("exp-1", ops));
    let orch = build(source, &["exp-1"], Duration::from_secs(5));
    let mut resp = html_response(PAGE);

    let reports = orch.modify_response(&visitor(), &mut resp).await;

    assert_eq!(reports[0].status, TransformStatus::Hit);
    assert_eq!(reports[0].operations_applied, 1);
    assert!(std::str::from_utf8(&resp.body).unwrap().contains("Buy Now"));
}

#[tokio::test]
async fn experiments_apply_in_configured_order() {
    let source = Arc::new(
        single_variant_source("exp-a", set_cta("From A"))
            .with_variants("exp-b", vec![variant("v-b", "treatment-b", 1.0)])
            .with_operations("exp-b", "v-b", set_cta("From B")),
    );
    let orch = build(source, &["exp-a", "exp-b"], Duration::from_secs(5));
    let mut resp = html_response(PAGE);

    let reports = orch.modify_response(&visitor(), &mut resp).await;

    let order: Vec<_> = reports.iter().map(|r| r.experiment_id.as_str()).collect();
    assert_eq!(order, vec!["exp-a", "exp-b"]);
    assert!(reports.iter().all(|r| r.status == TransformStatus::Hit));
    let body = std::str::from_utf8(&resp.body).unwrap();
    assert!(body.contains(r#"<button id="cta">From B</button>"#));

    // Last attempt wins the shared headers; cookies accumulate.
    assert_eq!(header(&resp, "x-ef-experiment"), "exp-b");
    assert_eq!(header(&resp, "x-ef-variant"), "treatment-b");
    assert_eq!(set_cookies(&resp).len(), 2);
}

#[tokio::test]
async fn failed_experiment_does_not_stop_later_ones() {
    let source = Arc::new(
        MockSource::default()
            .with_variants("exp-b", vec![variant("v-b", "treatment-b", 1.0)])
            .with_operations("exp-b", "v-b", set_cta("From B")),
    );
    let orch = build(source, &["exp-missing", "exp-b"], Duration::from_secs(5));
    let mut resp = html_response(PAGE);

    let reports = orch.modify_response(&visitor(), &mut resp).await;

    assert_eq!(reports[0].status, TransformStatus::Miss);
    assert_eq!(reports[1].status, TransformStatus::Hit);
    assert!(std::str::from_utf8(&resp.body).unwrap().contains("From B"));
}

#[tokio::test]
async fn same_visitor_lands_in_same_variant() {
    let variants = vec![variant("v-a", "control", 0.5), variant("v-b", "treatment", 0.5)];
    let source = Arc::new(MockSource::default().with_variants("exp-1", variants));
    let orch = build(source, &["exp-1"], Duration::from_secs(5));

    let mut first = html_response(PAGE);
    let a = orch.modify_response(&visitor(), &mut first).await;
    let mut second = html_response(PAGE);
    let b = orch.modify_response(&visitor(), &mut second).await;

    assert_eq!(a[0].variant_id, b[0].variant_id);
}

#[tokio::test]
async fn user_id_cookie_drives_bucketing() {
    let variants = vec![variant("v-a", "control", 0.5), variant("v-b", "treatment", 0.5)];
    let expected = Assigner::new(SALT)
        .unwrap()
        .assign_variant("user-42", "exp-1", &variants)
        .map(|v| v.id.clone())
        .unwrap();

    let source = Arc::new(MockSource::default().with_variants("exp-1", variants));
    let orch = build(source, &["exp-1"], Duration::from_secs(5));
    let visitor = visitor().with_cookie("uid", "user-42");

    for _ in 0..5 {
        let mut resp = html_response(PAGE);
        let reports = orch.modify_response(&visitor, &mut resp).await;
        assert_eq!(reports[0].variant_id, expected);
    }
}
