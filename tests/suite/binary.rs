//! Runs the `quire` binary against a mock vault server

use std::path::Path;
use std::process::{Command, Output};

use serde_json::json;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::common::{chunks, file_path, mount_document, mount_generation, saved};

/// Run the binary with an isolated home and config path.
async fn quire(home: &Path, server: &MockServer, args: &[&str]) -> Output {
    let mut command = Command::new(env!("CARGO_BIN_EXE_quire"));
    command
        .arg("--server")
        .arg(server.uri())
        .args(args)
        .env("HOME", home)
        .env("QUIRE_CONFIG", home.join("config.toml"))
        .env_remove("QUIRE_API_BASE_URL")
        .env_remove("RUST_LOG");
    tokio::task::spawn_blocking(move || command.output().expect("run quire"))
        .await
        .expect("join quire")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[tokio::test(flavor = "multi_thread")]
async fn show_prints_the_document() {
    let home = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    mount_document(&server, "notes/a.md", "# Title\nbody").await;

    let output = quire(home.path(), &server, &["show", "notes/a.md"]).await;

    assert!(output.status.success(), "{output:?}");
    assert_eq!(stdout(&output), "# Title\nbody\n");
    assert!(home.path().join("logs").join("quire.log").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn optimize_with_yes_saves_the_result() {
    let home = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    mount_document(&server, "a.md", "X").await;
    mount_generation(&server, "optimize", &chunks(&["Y", "Z"])).await;
    Mock::given(method("PUT"))
        .and(path(file_path("a.md")))
        .and(body_json(json!({ "content": "YZ" })))
        .respond_with(saved())
        .expect(1)
        .mount(&server)
        .await;

    let output = quire(home.path(), &server, &["optimize", "a.md", "--yes"]).await;

    assert!(output.status.success(), "{output:?}");
    let out = stdout(&output);
    assert!(out.contains("1 +YZ"), "{out}");
    assert!(out.contains("Saved a.md."), "{out}");
}

#[tokio::test(flavor = "multi_thread")]
async fn advise_streams_the_answer() {
    let home = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    mount_document(&server, "a.md", "X").await;
    mount_generation(&server, "advise", &chunks(&["Looks ", "good."])).await;

    let output = quire(home.path(), &server, &["advise", "a.md", "is", "it", "ok?"]).await;

    assert!(output.status.success(), "{output:?}");
    assert_eq!(stdout(&output), "Looks good.\n");
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_document_fails() {
    let home = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(file_path("gone.md")))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let output = quire(home.path(), &server, &["show", "gone.md"]).await;

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("gone.md"));
}

#[tokio::test(flavor = "multi_thread")]
async fn tree_lists_the_vault() {
    let home = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/knowledge/tree"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "tree": [
                { "key": "notes", "title": "notes", "is_leaf": false, "children": [
                    { "key": "notes/a.md", "title": "a.md", "is_leaf": true }
                ]}
            ]}
        })))
        .mount(&server)
        .await;

    let output = quire(home.path(), &server, &["tree"]).await;

    assert!(output.status.success(), "{output:?}");
    assert_eq!(stdout(&output), "notes/\n  a.md\n");
}
