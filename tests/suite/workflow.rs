//! End-to-end controller workflows over HTTP

use serde_json::json;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use quire_engine::quire_providers::StoreError;
use quire_engine::quire_types::{ChatRole, GenerationMode, StreamFailure};
use quire_engine::{GenerationStatus, Notice};

use crate::common::{
    chunks, controller, file_path, fragments, key, mount_document, mount_generation, saved, settle,
};

#[tokio::test]
async fn optimize_then_confirm_writes_the_preview() {
    let server = MockServer::start().await;
    mount_document(&server, "notes/a.md", "X").await;
    Mock::given(method("POST"))
        .and(path("/ai/optimize"))
        .and(body_json(json!({ "filename": "notes/a.md" })))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(crate::common::record_body(&chunks(&[
                "Y", "Z",
            ]))),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path(file_path("notes/a.md")))
        .and(body_json(json!({ "content": "YZ" })))
        .respond_with(saved())
        .expect(1)
        .mount(&server)
        .await;

    let mut c = controller(&server);
    c.open_document(key("notes/a.md")).unwrap();
    settle(&mut c).await;

    let id = c.start_optimize().unwrap();
    let notices = settle(&mut c).await;
    assert_eq!(fragments(&notices), "YZ");
    let generation = c.generation().unwrap();
    assert_eq!(generation.status(), GenerationStatus::Previewing);
    assert_eq!(generation.preview_diff(), "1 -X\n1 +YZ\n");

    c.confirm_preview().unwrap();
    assert_eq!(
        settle(&mut c).await,
        vec![Notice::Committed {
            id,
            key: key("notes/a.md")
        }]
    );
    assert_eq!(c.session(&key("notes/a.md")).unwrap().content(), "YZ");
}

#[tokio::test]
async fn edit_sends_the_instruction_as_requirement() {
    let server = MockServer::start().await;
    mount_document(&server, "a.md", "long text").await;
    Mock::given(method("POST"))
        .and(path("/ai/edit"))
        .and(body_json(json!({ "filename": "a.md", "requirement": "make it short" })))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(crate::common::record_body(&chunks(&["short"]))),
        )
        .expect(1)
        .mount(&server)
        .await;

    let mut c = controller(&server);
    c.open_document(key("a.md")).unwrap();
    settle(&mut c).await;
    c.start_edit("make it short").unwrap();
    settle(&mut c).await;

    let generation = c.generation().unwrap();
    assert_eq!(generation.mode(), GenerationMode::Edit);
    assert_eq!(generation.accumulated(), "short");
    assert_eq!(generation.original_content(), "long text");
}

#[tokio::test]
async fn advise_fills_the_conversation() {
    let server = MockServer::start().await;
    mount_document(&server, "a.md", "text").await;
    mount_generation(&server, "advise", &chunks(&["It is ", "fine."])).await;

    let mut c = controller(&server);
    c.open_document(key("a.md")).unwrap();
    let id = c.start_advise("is it ok?").unwrap();
    let notices = settle(&mut c).await;

    assert!(notices.contains(&Notice::AdviceComplete { id, key: key("a.md") }));
    let messages = c.transcript(&key("a.md")).unwrap().messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].role, ChatRole::Assistant);
    assert_eq!(messages[1].text, "It is fine.");
    assert_eq!(c.generation_status(), GenerationStatus::Idle);
}

#[tokio::test]
async fn failed_commit_keeps_preview_for_retry() {
    let server = MockServer::start().await;
    mount_document(&server, "a.md", "old").await;
    mount_generation(&server, "optimize", &chunks(&["new"])).await;
    Mock::given(method("PUT"))
        .and(path(file_path("a.md")))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({ "message": "disk full" })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path(file_path("a.md")))
        .respond_with(saved())
        .mount(&server)
        .await;

    let mut c = controller(&server);
    c.open_document(key("a.md")).unwrap();
    settle(&mut c).await;
    c.start_optimize().unwrap();
    settle(&mut c).await;

    c.confirm_preview().unwrap();
    let notices = settle(&mut c).await;
    match notices.as_slice() {
        [Notice::CommitFailed { error, .. }] => assert_eq!(
            error,
            &StoreError::Rejected {
                status: 500,
                message: "disk full".into()
            }
        ),
        other => panic!("expected a failed commit, got {other:?}"),
    }
    assert_eq!(c.generation_status(), GenerationStatus::Previewing);
    assert_eq!(c.session(&key("a.md")).unwrap().content(), "old");

    c.confirm_preview().unwrap();
    let notices = settle(&mut c).await;
    assert!(matches!(notices.as_slice(), [Notice::Committed { .. }]));
    assert_eq!(c.session(&key("a.md")).unwrap().content(), "new");
}

#[tokio::test]
async fn remote_error_record_discards_the_generation() {
    let server = MockServer::start().await;
    mount_document(&server, "a.md", "old").await;
    mount_generation(
        &server,
        "optimize",
        &[
            json!({ "type": "chunk", "content": "par" }),
            json!({ "type": "error", "message": "model overloaded" }),
        ],
    )
    .await;

    let mut c = controller(&server);
    c.open_document(key("a.md")).unwrap();
    settle(&mut c).await;
    c.start_optimize().unwrap();
    let notices = settle(&mut c).await;

    assert!(matches!(
        notices.last(),
        Some(Notice::GenerationFailed { failure: StreamFailure::Remote(msg), .. }) if msg == "model overloaded"
    ));
    assert_eq!(c.generation_status(), GenerationStatus::Idle);
    assert_eq!(c.session(&key("a.md")).unwrap().content(), "old");
}

#[tokio::test]
async fn rejected_generation_request_is_a_transport_failure() {
    let server = MockServer::start().await;
    mount_document(&server, "a.md", "old").await;
    Mock::given(method("POST"))
        .and(path("/ai/optimize"))
        .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
        .mount(&server)
        .await;

    let mut c = controller(&server);
    c.open_document(key("a.md")).unwrap();
    settle(&mut c).await;
    c.start_optimize().unwrap();
    let notices = settle(&mut c).await;

    assert!(matches!(
        notices.as_slice(),
        [Notice::GenerationFailed { failure: StreamFailure::Transport(msg), .. }] if msg.contains("503")
    ));
}

#[tokio::test]
async fn missing_document_reports_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(file_path("gone.md")))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({ "message": "no such file" })))
        .mount(&server)
        .await;

    let mut c = controller(&server);
    c.open_document(key("gone.md")).unwrap();
    assert_eq!(
        settle(&mut c).await,
        vec![Notice::LoadFailed {
            key: key("gone.md"),
            error: StoreError::NotFound(key("gone.md")),
        }]
    );
    assert_eq!(
        c.start_optimize(),
        Err(quire_engine::ControllerError::DocumentNotLoaded(key("gone.md")))
    );
}

#[tokio::test]
async fn tree_listing_feeds_candidates() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/knowledge/tree"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "tree": [
                { "key": "notes", "title": "notes", "is_leaf": false, "children": [
                    { "key": "notes/a.md", "title": "a.md", "is_leaf": true, "children": null }
                ]},
                { "key": "img.png", "title": "img.png", "is_leaf": true, "children": null }
            ]}
        })))
        .mount(&server)
        .await;

    let base_url =
        quire_engine::quire_providers::parse_base_url(&server.uri()).expect("mock server URL");
    let tree = quire_engine::quire_providers::HttpDocumentStore::new(base_url);
    let mut c = controller(&server);

    assert_eq!(c.refresh_tree(&tree).await.unwrap(), 1);
    assert_eq!(c.tabs().candidates(), &[key("notes/a.md")]);
}
