mod common;

use std::time::Duration;

use chrono::FixedOffset;

use loadscribe_runtime::providers::{ApiCredential, CredentialSource};
use loadscribe_runtime::{ConfluenceClient, WikiError};

use common::FakeWiki;

async fn wiki_client(wiki: &FakeWiki) -> ConfluenceClient {
    let base = common::spawn(wiki.router()).await;
    ConfluenceClient::new(
        &base,
        "reporter",
        ApiCredential::new("secret", CredentialSource::Programmatic, "Confluence password"),
        reqwest::Client::new(),
    )
    .with_stale_retry(3, Duration::from_millis(5))
}

#[tokio::test]
async fn copy_page_creates_titled_child_with_template_body() {
    let wiki = FakeWiki::new();
    wiki.add_page("100", "Checkout template", "<p>$$rps$$</p>");
    let client = wiki_client(&wiki).await;

    let offset = FixedOffset::east_opt(3 * 3600).unwrap();
    let page = client.copy_page("100", "10", &offset).await.unwrap();

    let stored = wiki.page(&page.id).unwrap();
    assert!(stored.title.starts_with("Checkout template - report "));
    assert_eq!(stored.body, "<p>$$rps$$</p>");
    assert_eq!(stored.space, "LT");
    assert_eq!(stored.parent.as_deref(), Some("10"));
}

#[tokio::test]
async fn update_placeholder_bumps_version() {
    let wiki = FakeWiki::new();
    wiki.add_page("7", "Report", "<p>$$answer_jvm$$</p><p>$$rps$$</p>");
    let client = wiki_client(&wiki).await;

    let page = client
        .update_placeholder("7", "answer_jvm", "<p>heap is fine</p>")
        .await
        .unwrap();
    assert_eq!(page.version.number, 2);

    let stored = wiki.page("7").unwrap();
    assert_eq!(stored.body, "<p><p>heap is fine</p></p><p>$$rps$$</p>");
}

#[tokio::test]
async fn stale_update_is_retried() {
    let wiki = FakeWiki::new();
    wiki.add_page("7", "Report", "<p>$$rps$$</p>");
    wiki.fail_next_updates(2);
    let client = wiki_client(&wiki).await;

    client.update_placeholder("7", "rps", "42").await.unwrap();

    assert_eq!(wiki.put_count(), 3);
    assert_eq!(wiki.page("7").unwrap().body, "<p>42</p>");
}

#[tokio::test]
async fn stale_update_gives_up_after_configured_attempts() {
    let wiki = FakeWiki::new();
    wiki.add_page("7", "Report", "<p>$$rps$$</p>");
    wiki.fail_next_updates(10);
    let client = wiki_client(&wiki).await;

    let err = client.update_placeholder("7", "rps", "42").await.unwrap_err();
    assert!(err.is_stale());
    assert_eq!(wiki.put_count(), 3);
}

#[tokio::test]
async fn missing_placeholder_is_typed_error() {
    let wiki = FakeWiki::new();
    wiki.add_page("7", "Report", "<p>nothing here</p>");
    let client = wiki_client(&wiki).await;

    let err = client
        .update_placeholder("7", "final_answer", "x")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        WikiError::PlaceholderNotFound { ref placeholder, .. } if placeholder == "final_answer"
    ));
    assert_eq!(wiki.put_count(), 0);
}

#[tokio::test]
async fn missing_page_is_status_error() {
    let wiki = FakeWiki::new();
    let client = wiki_client(&wiki).await;

    let err = client.get_page("404").await.unwrap_err();
    assert!(matches!(err, WikiError::Status(ref s) if s.status == 404));
}

#[tokio::test]
async fn attachment_upload_is_multipart_with_nocheck() {
    let wiki = FakeWiki::new();
    wiki.add_page("7", "Report", "");
    let client = wiki_client(&wiki).await;

    client
        .upload_attachment("7", "rps_checkout_7.jpg", vec![1, 2, 3], "image/jpeg")
        .await
        .unwrap();

    let attachments = wiki.attachments();
    assert_eq!(attachments.len(), 1);
    assert_eq!(attachments[0].page_id, "7");
    assert!(attachments[0].nocheck);
    let body = String::from_utf8_lossy(&attachments[0].body);
    assert!(body.contains("name=\"file\""));
    assert!(body.contains("filename=\"rps_checkout_7.jpg\""));
}
