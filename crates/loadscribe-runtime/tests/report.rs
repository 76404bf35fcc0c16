mod common;

use std::sync::Arc;

use axum::extract::Query;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use loadscribe_core::markup::find_placeholders;
use loadscribe_core::ReportConfig;
use loadscribe_runtime::{analysis_pipeline, ReportBuilder, RuntimeError};

use common::{FakeChat, FakeWiki, Params};

const START_MS: i64 = 1_740_126_000_000;
const END_MS: i64 = 1_740_127_200_000;

const TEMPLATE: &str = "<h2>Throughput</h2><p>$$rps$$</p>\
<h2>Resources</h2><p>$$resources$$</p>\
<h2>Errors</h2><p>$$errors_log$$</p><p>$$panic_log$$</p>\
<h2>JVM</h2><p>$$answer_jvm$$</p>\
<h2>Conclusion</h2><p>$$final_answer$$</p>";

struct Backends {
    wiki: FakeWiki,
    chat: FakeChat,
    wiki_url: String,
    grafana_url: String,
    loki_url: String,
    prometheus_url: String,
    chat_url: String,
}

async fn backends(template: &str) -> Backends {
    let wiki = FakeWiki::new();
    wiki.add_page("100", "Checkout load test", template);
    let wiki_url = common::spawn(wiki.router()).await;

    let grafana = Router::new().route(
        "/render/d-solo/:uid/:slug",
        get(|| async { vec![0xFF_u8, 0xD8, 0xFF, 0xD9] }),
    );
    let grafana_url = common::spawn(grafana).await;

    let loki = Router::new().route(
        "/loki/api/v1/query_range",
        get(|Query(params): Query<Params>| async move {
            let values = if params["query"].contains("ERROR") {
                json!([["1740126300000000000", "ERROR upstream timeout"]])
            } else {
                json!([])
            };
            Json(json!({
                "status": "success",
                "data": {"resultType": "streams", "result": [{"stream": {"app": "checkout"}, "values": values}]}
            }))
        }),
    );
    let loki_url = common::spawn(loki).await;

    let prometheus = common::prometheus_router(common::matrix(
        "area",
        vec![
            ("heap", vec![(1_740_126_000, "1000000"), (1_740_126_600, "1200000")]),
            ("nonheap", vec![(1_740_126_000, "300000")]),
        ],
    ));
    let prometheus_url = common::spawn(prometheus).await;

    let chat = FakeChat::new([
        r#"{"verdict": "heap stable", "confidence": 0.9, "findings": ["no GC pressure"]}"#,
        r#"{"verdict": "run passed", "confidence": 0.8}"#,
    ]);
    let chat_url = common::spawn(chat.router()).await;

    Backends {
        wiki,
        chat,
        wiki_url,
        grafana_url,
        loki_url,
        prometheus_url,
        chat_url,
    }
}

fn config(b: &Backends) -> ReportConfig {
    let yaml = format!(
        r#"
wiki:
  url: {wiki}
  username: reporter
  password: secret
grafana:
  base_url: {grafana}
  api_key: glsa_test
loki:
  url: {loki}/loki/api/v1/query_range
metrics_source:
  type: prometheus
  prometheus_url: {prometheus}
llm:
  provider: openai_compatible
  attempts: 1
  call_retries: 1
  retry_delay: 1ms
  options:
    base_url: {chat}
    api_key: sk-test
    model: fake-model
analysis:
  step: 1m
  resample: 10m
  utc_offset_hours: 0
runtime:
  concurrency: 2
  wiki_update_attempts: 30
  wiki_retry_delay: 5ms
domains:
  - name: jvm
    title: JVM
    queries:
      - title: Heap used
        expr: sum by (area) (jvm_memory_used_bytes)
        label_keys: [area]
services:
  checkout:
    template_page_id: "100"
    parent_page_id: "10"
    panels:
      - name: rps
        path: /render/d-solo/abc/rps?orgId=1&panelId=1
      - name: cpu
        path: /render/d-solo/abc/cpu?orgId=1&panelId=2
        group: resources
      - name: memory
        path: /render/d-solo/abc/memory?orgId=1&panelId=3
        group: resources
    logs:
      - placeholder: errors_log
        filter: '{{app="checkout"}} |= "ERROR"'
      - placeholder: $$panic_log$$
        filter: '{{app="checkout"}} |= "PANIC"'
"#,
        wiki = b.wiki_url,
        grafana = b.grafana_url,
        loki = b.loki_url,
        prometheus = b.prometheus_url,
        chat = b.chat_url,
    );
    ReportConfig::from_yaml(&yaml).unwrap()
}

#[tokio::test]
async fn report_fills_every_placeholder() {
    let b = backends(TEMPLATE).await;
    let config = config(&b);

    let pipeline = Arc::new(analysis_pipeline(&config).unwrap());
    let builder = ReportBuilder::from_config(&config)
        .unwrap()
        .with_analysis(pipeline);

    let outcome = builder.build("checkout", START_MS, END_MS).await.unwrap();
    assert!(outcome.is_complete(), "failures: {:?}", outcome.failures);

    let mut updated = outcome.updated.clone();
    updated.sort();
    assert_eq!(
        updated,
        vec!["answer_jvm", "errors_log", "final_answer", "panic_log", "resources", "rps"]
    );

    let page = b.wiki.page(&outcome.page_id).unwrap();
    assert!(page.title.starts_with("Checkout load test - report "));
    assert!(find_placeholders(&page.body).is_empty(), "left: {}", page.body);

    let rps_image = format!("rps_checkout_{}.jpg", outcome.page_id);
    assert!(page.body.contains(&format!(
        "<ac:image><ri:attachment ri:filename=\"{}\" /></ac:image>",
        rps_image
    )));
    assert!(page.body.contains("ac:name=\"ui-tabs\""));
    assert!(page.body.contains("ac:name=\"view-file\""));
    assert!(page.body.contains("<p></p>"), "empty log leaves an empty slot");
    assert!(page.body.contains("heap stable"));
    assert!(page.body.contains("run passed"));
    assert!(page.body.contains("<table>"));

    // rps, cpu, memory and both logs
    let attachments = b.wiki.attachments();
    assert_eq!(attachments.len(), 5);
    assert!(attachments.iter().all(|a| a.page_id == outcome.page_id && a.nocheck));
    assert!(attachments
        .iter()
        .any(|a| String::from_utf8_lossy(&a.body).contains("ERROR upstream timeout")));

    // the empty log is still attached, just not shown
    let panic_file = format!("checkout_panic_log_{}.log", outcome.page_id);
    let panic_attachment = attachments
        .iter()
        .find(|a| String::from_utf8_lossy(&a.body).contains(&panic_file))
        .expect("empty log attachment");
    assert!(!String::from_utf8_lossy(&panic_attachment.body).contains("PANIC"));
    assert!(!page.body.contains(&panic_file));

    assert_eq!(b.chat.requests().len(), 2);
}

#[tokio::test]
async fn missing_slot_is_recorded_not_fatal() {
    let b = backends("<p>$$rps$$</p>").await;
    let config = config(&b);

    let builder = ReportBuilder::from_config(&config).unwrap();
    let outcome = builder.build("checkout", START_MS, END_MS).await.unwrap();

    assert_eq!(outcome.updated, vec!["rps"]);
    let mut failed: Vec<&str> = outcome
        .failures
        .iter()
        .map(|f| f.placeholder.as_str())
        .collect();
    failed.sort();
    assert_eq!(failed, vec!["errors_log", "panic_log", "resources"]);
    assert!(outcome.failures[0].error.contains("not found"));
    assert!(b.chat.requests().is_empty());
}

#[tokio::test]
async fn unknown_service_is_an_error() {
    let b = backends(TEMPLATE).await;
    let builder = ReportBuilder::from_config(&config(&b)).unwrap();

    let err = builder.build("billing", START_MS, END_MS).await.unwrap_err();
    assert!(matches!(err, RuntimeError::UnknownService(name) if name == "billing"));
}
