//! Local stand-ins for the HTTP backends, served by axum on 127.0.0.1:0.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Value};

/// Serve `router` on an ephemeral port and return its base URL.
pub async fn spawn(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

#[derive(Debug, Clone)]
pub struct StoredPage {
    pub title: String,
    pub space: String,
    pub body: String,
    pub version: u64,
    pub parent: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StoredAttachment {
    pub page_id: String,
    pub body: Vec<u8>,
    pub nocheck: bool,
}

#[derive(Debug, Default)]
struct WikiState {
    pages: HashMap<String, StoredPage>,
    attachments: Vec<StoredAttachment>,
    next_id: u64,
    stale_updates: usize,
    puts: usize,
}

/// In-memory Confluence content API.
#[derive(Debug, Clone, Default)]
pub struct FakeWiki {
    state: Arc<Mutex<WikiState>>,
}

fn page_json(id: &str, page: &StoredPage) -> Value {
    json!({
        "id": id,
        "type": "page",
        "title": page.title,
        "space": {"key": page.space},
        "body": {"storage": {"value": page.body, "representation": "storage"}},
        "version": {"number": page.version},
    })
}

impl FakeWiki {
    pub fn new() -> Self {
        let wiki = Self::default();
        wiki.state.lock().next_id = 1000;
        wiki
    }

    pub fn add_page(&self, id: &str, title: &str, body: &str) {
        self.state.lock().pages.insert(
            id.to_string(),
            StoredPage {
                title: title.to_string(),
                space: "LT".to_string(),
                body: body.to_string(),
                version: 1,
                parent: None,
            },
        );
    }

    pub fn page(&self, id: &str) -> Option<StoredPage> {
        self.state.lock().pages.get(id).cloned()
    }

    pub fn attachments(&self) -> Vec<StoredAttachment> {
        self.state.lock().attachments.clone()
    }

    /// The next `n` updates answer 409 as if another writer got there first.
    pub fn fail_next_updates(&self, n: usize) {
        self.state.lock().stale_updates = n;
    }

    pub fn put_count(&self) -> usize {
        self.state.lock().puts
    }

    pub fn router(&self) -> Router {
        let get_state = self.state.clone();
        let put_state = self.state.clone();
        let create_state = self.state.clone();
        let attach_state = self.state.clone();

        Router::new()
            .route(
                "/rest/api/content/:id",
                get(move |Path(id): Path<String>| {
                    let state = get_state.clone();
                    async move {
                        match state.lock().pages.get(&id) {
                            Some(page) => Json(page_json(&id, page)).into_response(),
                            None => (StatusCode::NOT_FOUND, "No content found").into_response(),
                        }
                    }
                })
                .put(move |Path(id): Path<String>, Json(payload): Json<Value>| {
                    let state = put_state.clone();
                    async move { update(&state, &id, &payload) }
                }),
            )
            .route(
                "/rest/api/content",
                post(move |Json(payload): Json<Value>| {
                    let state = create_state.clone();
                    async move { create(&state, &payload) }
                }),
            )
            .route(
                "/rest/api/content/:id/child/attachment",
                post(move |Path(id): Path<String>, headers: HeaderMap, body: Bytes| {
                    let state = attach_state.clone();
                    async move {
                        let nocheck = headers
                            .get("X-Atlassian-Token")
                            .and_then(|v| v.to_str().ok())
                            == Some("nocheck");
                        state.lock().attachments.push(StoredAttachment {
                            page_id: id,
                            body: body.to_vec(),
                            nocheck,
                        });
                        Json(json!({"results": []}))
                    }
                }),
            )
    }
}

fn update(state: &Mutex<WikiState>, id: &str, payload: &Value) -> Response {
    let mut state = state.lock();
    state.puts += 1;
    if state.stale_updates > 0 {
        state.stale_updates -= 1;
        return (
            StatusCode::CONFLICT,
            "Attempted to update stale data. Version must be incremented.",
        )
            .into_response();
    }

    let Some(page) = state.pages.get_mut(id) else {
        return (StatusCode::NOT_FOUND, "No content found").into_response();
    };
    let version = payload["version"]["number"].as_u64().unwrap_or(0);
    if version != page.version + 1 {
        return (StatusCode::CONFLICT, "Version mismatch").into_response();
    }

    page.version = version;
    page.body = payload["body"]["storage"]["value"]
        .as_str()
        .unwrap_or_default()
        .to_string();
    Json(page_json(id, page)).into_response()
}

fn create(state: &Mutex<WikiState>, payload: &Value) -> Response {
    let mut state = state.lock();
    state.next_id += 1;
    let id = state.next_id.to_string();
    let page = StoredPage {
        title: payload["title"].as_str().unwrap_or_default().to_string(),
        space: payload["space"]["key"].as_str().unwrap_or_default().to_string(),
        body: payload["body"]["storage"]["value"]
            .as_str()
            .unwrap_or_default()
            .to_string(),
        version: 1,
        parent: payload["ancestors"][0]["id"].as_str().map(str::to_string),
    };
    let body = page_json(&id, &page);
    state.pages.insert(id, page);
    Json(body).into_response()
}

/// Chat-completions endpoint replying from a script, recording requests.
#[derive(Debug, Clone, Default)]
pub struct FakeChat {
    replies: Arc<Mutex<VecDeque<String>>>,
    requests: Arc<Mutex<Vec<Value>>>,
}

impl FakeChat {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Arc::new(Mutex::new(replies.into_iter().map(Into::into).collect())),
            requests: Arc::default(),
        }
    }

    pub fn requests(&self) -> Vec<Value> {
        self.requests.lock().clone()
    }

    pub fn router(&self) -> Router {
        let replies = self.replies.clone();
        let requests = self.requests.clone();
        Router::new().route(
            "/chat/completions",
            post(move |headers: HeaderMap, Json(body): Json<Value>| {
                let replies = replies.clone();
                let requests = requests.clone();
                async move {
                    let authorized = headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .is_some_and(|v| v.starts_with("Bearer "));
                    if !authorized {
                        return (StatusCode::UNAUTHORIZED, "missing token").into_response();
                    }

                    requests.lock().push(body);
                    let content = replies
                        .lock()
                        .pop_front()
                        .unwrap_or_else(|| r#"{"verdict": "ok"}"#.to_string());
                    Json(json!({
                        "model": "fake-model",
                        "choices": [{
                            "message": {"role": "assistant", "content": content},
                            "finish_reason": "stop"
                        }],
                        "usage": {"prompt_tokens": 10, "completion_tokens": 5}
                    }))
                    .into_response()
                }
            }),
        )
    }
}

/// Range-query params as received by a mock.
pub type Params = HashMap<String, String>;

/// A Prometheus-style matrix response with one series per `(label, values)`.
pub fn matrix(label_key: &str, series: Vec<(&str, Vec<(i64, &str)>)>) -> Value {
    let result: Vec<Value> = series
        .into_iter()
        .map(|(label, values)| {
            let values: Vec<Value> = values.into_iter().map(|(ts, v)| json!([ts, v])).collect();
            let mut metric = serde_json::Map::new();
            metric.insert(label_key.to_string(), json!(label));
            json!({"metric": metric, "values": values})
        })
        .collect();
    json!({"status": "success", "data": {"resultType": "matrix", "result": result}})
}

/// Router answering every range query with the same body.
pub fn prometheus_router(body: Value) -> Router {
    Router::new().route(
        "/api/v1/query_range",
        get(move |Query(_params): Query<Params>| {
            let body = body.clone();
            async move { Json(body) }
        }),
    )
}
