//! Shared test utilities and fixtures
//!
//! A wiremock vault server and a controller wired to it over HTTP.

#![allow(dead_code)]

use std::sync::Arc;

use serde_json::{Value, json};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use quire_engine::quire_providers::retry::RetryConfig;
use quire_engine::quire_providers::{HttpDocumentStore, HttpGenerationClient, parse_base_url};
use quire_engine::quire_types::DocKey;
use quire_engine::{Controller, Notice};

pub fn key(raw: &str) -> DocKey {
    DocKey::new(raw).expect("valid test key")
}

pub fn file_path(raw: &str) -> String {
    format!("/knowledge/file/{raw}")
}

/// Serve `content` for `GET /knowledge/file/{raw}`.
pub async fn mount_document(server: &MockServer, raw: &str, content: &str) {
    Mock::given(method("GET"))
        .and(path(file_path(raw)))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "data": { "content": content } })),
        )
        .mount(server)
        .await;
}

/// Newline-delimited record stream body.
pub fn record_body(records: &[Value]) -> String {
    records.iter().map(|r| format!("{r}\n")).collect()
}

/// The chunk records the vault server sends for `fragments`, then `complete`.
pub fn chunks(fragments: &[&str]) -> Vec<Value> {
    let mut records: Vec<Value> = fragments
        .iter()
        .map(|text| json!({ "type": "chunk", "content": text }))
        .collect();
    records.push(json!({ "type": "complete", "status": "done" }));
    records
}

/// Serve `records` for `POST /ai/{action}`.
pub async fn mount_generation(server: &MockServer, action: &str, records: &[Value]) {
    Mock::given(method("POST"))
        .and(path(format!("/ai/{action}")))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(record_body(records))
                .insert_header("content-type", "application/x-ndjson"),
        )
        .mount(server)
        .await;
}

pub fn saved() -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({ "status": "ok" }))
}

/// A controller talking to `server`, with retries off so failures are immediate.
pub fn controller(server: &MockServer) -> Controller {
    let base_url = parse_base_url(&server.uri()).expect("mock server URL");
    let store = HttpDocumentStore::new(base_url.clone()).with_retry(RetryConfig::disabled());
    let backend = HttpGenerationClient::new(base_url).with_retry(RetryConfig::disabled());
    Controller::new(Arc::new(store), Arc::new(backend))
}

/// Await notices until nothing is outstanding.
pub async fn settle(controller: &mut Controller) -> Vec<Notice> {
    let mut all = Vec::new();
    while let Some(batch) = controller.next_notices().await {
        all.extend(batch);
    }
    all
}

pub fn fragments(notices: &[Notice]) -> String {
    notices
        .iter()
        .filter_map(|n| match n {
            Notice::Fragment { text, .. } => Some(text.as_str()),
            _ => None,
        })
        .collect()
}
