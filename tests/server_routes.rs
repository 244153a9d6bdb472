#![cfg(unix)]

use actix_web::cookie::Cookie;
use actix_web::http::StatusCode;
use actix_web::{test, web};
use async_trait::async_trait;
use automanim::api::{ChatMessage, ProviderKind, SceneModel};
use automanim::config::Config;
use automanim::error::Result;
use automanim::quality::Quality;
use automanim::server::session::SESSION_COOKIE;
use automanim::server::{AppState, build_app};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const GOOD: &str = "from manim import *\n\nclass MainScene(Scene):\n    def construct(self):\n        self.play(Create(Circle()))\n";
const BROKEN: &str = "from manim import *\n\nclass MainScene(Scene):\n    def construct(self):\n        self.play(Create(BROKEN()))\n";

// argv after `sh -c <script> renderer`: -q <q> --media_dir <media> <script> <scene>
const FAKE_RENDERER: &str = r#"echo "rendering $6"
if grep -q BROKEN "$5"; then echo "NameError: name 'BROKEN' is not defined" >&2; exit 1; fi
stem=$(basename "$5" .py); out="$4/videos/$stem/480p15"; mkdir -p "$out"; printf video-bytes > "$out/$6.mp4""#;

/// Always answers with the same scene, whatever it is asked.
struct FixedModel;

#[async_trait]
impl SceneModel for FixedModel {
    fn name(&self) -> &'static str {
        "Fixed"
    }

    async fn complete(
        &self,
        _system: &str,
        _history: &[ChatMessage],
        _prompt: &str,
    ) -> Result<String> {
        Ok(format!("Here you go:\n```python\n{}```\n", GOOD))
    }
}

fn config(root: &Path) -> Config {
    let mut cfg = Config::default();
    cfg.renderer.command = vec![
        "sh".into(),
        "-c".into(),
        FAKE_RENDERER.into(),
        "renderer".into(),
    ];
    cfg.renderer.media_dir = root.join("media");
    cfg.renderer.scripts_dir = root.join("scenes");
    cfg.renderer.quality = Some(Quality::Low);
    cfg.renderer.timeout_secs = 20;
    cfg.server.static_dir = root.join("static");
    cfg
}

/// Never manages to produce a scene that renders.
struct BrokenModel;

#[async_trait]
impl SceneModel for BrokenModel {
    fn name(&self) -> &'static str {
        "Broken"
    }

    async fn complete(
        &self,
        _system: &str,
        _history: &[ChatMessage],
        _prompt: &str,
    ) -> Result<String> {
        Ok(format!("```python\n{}```", BROKEN))
    }
}

fn state(root: &Path, with_model: bool) -> web::Data<AppState> {
    let mut models: HashMap<ProviderKind, Arc<dyn SceneModel>> = HashMap::new();
    if with_model {
        models.insert(ProviderKind::Groq, Arc::new(FixedModel));
    }
    web::Data::new(AppState::new(config(root), models).unwrap())
}

fn state_with(root: &Path, model: Arc<dyn SceneModel>) -> web::Data<AppState> {
    let models = HashMap::from([(ProviderKind::Groq, model)]);
    web::Data::new(AppState::new(config(root), models).unwrap())
}

fn session_cookie() -> Cookie<'static> {
    Cookie::new(SESSION_COOKIE, uuid::Uuid::new_v4().to_string())
}

#[actix_web::test]
async fn health_lists_configured_providers() {
    let root = tempfile::tempdir().unwrap();
    let app = test::init_service(build_app(state(root.path(), true))).await;

    let req = test::TestRequest::get().uri("/health").to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["providers"], json!(["groq"]));
    assert_eq!(body["renderer"], "sh");
}

#[actix_web::test]
async fn index_page_is_served_from_static_dir() {
    let root = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(root.path().join("static")).unwrap();
    std::fs::write(root.path().join("static/index.html"), "<h1>AutoManim</h1>").unwrap();
    let app = test::init_service(build_app(state(root.path(), true))).await;

    let req = test::TestRequest::get().uri("/").to_request();
    let body = test::call_and_read_body(&app, req).await;
    assert_eq!(&body[..], b"<h1>AutoManim</h1>");
}

#[actix_web::test]
async fn generate_rejects_blank_prompt_and_bad_json() {
    let root = tempfile::tempdir().unwrap();
    let app = test::init_service(build_app(state(root.path(), true))).await;

    let req = test::TestRequest::post()
        .uri("/generate_manim_code")
        .set_json(json!({ "manimPrompt": "   " }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["status"], "error");

    let req = test::TestRequest::post()
        .uri("/generate_manim_code")
        .insert_header(("content-type", "application/json"))
        .set_payload("{not json")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[actix_web::test]
async fn generate_without_provider_is_a_client_error() {
    let root = tempfile::tempdir().unwrap();
    let app = test::init_service(build_app(state(root.path(), false))).await;

    let req = test::TestRequest::post()
        .uri("/generate_manim_code")
        .set_json(json!({ "manimPrompt": "a circle" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[actix_web::test]
async fn generated_code_lands_in_session_history() {
    let root = tempfile::tempdir().unwrap();
    let app = test::init_service(build_app(state(root.path(), true))).await;
    let cookie = session_cookie();

    let req = test::TestRequest::post()
        .uri("/generate_manim_code")
        .cookie(cookie.clone())
        .set_json(json!({ "manimPrompt": "a circle" }))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["code"], GOOD);
    assert_eq!(body["scene_name"], "MainScene");

    let req = test::TestRequest::get()
        .uri("/get_chat_history")
        .cookie(cookie.clone())
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    let history = body["chat_history"].as_array().unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0]["role"], "user");
    assert_eq!(history[0]["content"], "a circle");
    assert_eq!(history[1]["role"], "assistant");

    // another browser sees nothing
    let req = test::TestRequest::get()
        .uri("/get_chat_history")
        .cookie(session_cookie())
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["chat_history"], json!([]));

    let req = test::TestRequest::post()
        .uri("/clear_chat_history")
        .cookie(cookie.clone())
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["status"], "success");

    let req = test::TestRequest::get()
        .uri("/get_chat_history")
        .cookie(cookie)
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["chat_history"], json!([]));
}

#[actix_web::test]
async fn first_visit_gets_a_session_cookie() {
    let root = tempfile::tempdir().unwrap();
    let app = test::init_service(build_app(state(root.path(), true))).await;

    let req = test::TestRequest::get().uri("/get_chat_history").to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.response().cookies().any(|c| c.name() == SESSION_COOKIE));
}

#[actix_web::test]
async fn execute_renders_and_serves_video() {
    let root = tempfile::tempdir().unwrap();
    let app = test::init_service(build_app(state(root.path(), true))).await;

    let req = test::TestRequest::post()
        .uri("/execute_manim")
        .set_json(json!({ "code": GOOD }))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["status"], "success");
    assert_eq!(body["attempts"].as_array().unwrap().len(), 1);

    let url = body["video_url"].as_str().unwrap().to_string();
    assert!(url.starts_with("/videos/"), "{}", url);
    assert!(url.ends_with("/MainScene.mp4"), "{}", url);

    let req = test::TestRequest::get().uri(&url).to_request();
    let video = test::call_and_read_body(&app, req).await;
    assert_eq!(&video[..], b"video-bytes");
}

#[actix_web::test]
async fn execute_repairs_broken_code_through_the_model() {
    let root = tempfile::tempdir().unwrap();
    let app = test::init_service(build_app(state(root.path(), true))).await;

    let req = test::TestRequest::post()
        .uri("/execute_manim")
        .set_json(json!({ "code": BROKEN }))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["status"], "success");
    assert_eq!(body["code"], GOOD);

    let attempts = body["attempts"].as_array().unwrap();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0]["success"], false);
    assert_eq!(attempts[0]["diagnostic"]["error_type"], "NameError");
}

#[actix_web::test]
async fn execute_rejects_code_without_scene() {
    let root = tempfile::tempdir().unwrap();
    let app = test::init_service(build_app(state(root.path(), true))).await;

    let req = test::TestRequest::post()
        .uri("/execute_manim")
        .set_json(json!({ "code": "print('hello')" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[actix_web::test]
async fn unknown_task_is_not_found() {
    let root = tempfile::tempdir().unwrap();
    let app = test::init_service(build_app(state(root.path(), true))).await;

    for uri in [
        "/api/tasks/nope",
        "/api/tasks/nope/logs",
        "/api/tasks/nope/events",
        "/api/video/nope/chunk",
    ] {
        let req = test::TestRequest::get().uri(uri).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND, "{}", uri);
    }
}

#[actix_web::test]
async fn background_task_runs_to_completion() {
    let root = tempfile::tempdir().unwrap();
    let app = test::init_service(build_app(state(root.path(), true))).await;
    let cookie = session_cookie();

    let req = test::TestRequest::post()
        .uri("/api/tasks")
        .cookie(cookie.clone())
        .set_json(json!({ "prompt": "a circle", "quality": "low" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    let body: Value = test::read_body_json(resp).await;
    let id = body["task_id"].as_str().unwrap().to_string();
    assert_eq!(body["status"], "queued");
    assert_eq!(body["events_url"], format!("/api/tasks/{}/events", id));

    let mut task = Value::Null;
    for _ in 0..200 {
        let req = test::TestRequest::get()
            .uri(&format!("/api/tasks/{}", id))
            .to_request();
        task = test::call_and_read_body_json(&app, req).await;
        if task["status"] == "completed" || task["status"] == "failed" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(task["status"], "completed", "{}", task);
    assert_eq!(task["code"], GOOD);
    assert!(task["video_url"].as_str().unwrap().starts_with("/videos/"));

    let req = test::TestRequest::get()
        .uri(&format!("/api/tasks/{}/logs?cursor=0", id))
        .to_request();
    let logs: Value = test::call_and_read_body_json(&app, req).await;
    let lines = logs["lines"].as_array().unwrap();
    assert!(lines.iter().any(|l| l == "[OUT] rendering MainScene"));
    let cursor = logs["next_cursor"].as_u64().unwrap();

    let req = test::TestRequest::get()
        .uri(&format!("/api/tasks/{}/logs?cursor={}", id, cursor))
        .to_request();
    let logs: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(logs["lines"], json!([]));

    let req = test::TestRequest::get()
        .uri(&format!("/api/tasks/{}/events", id))
        .to_request();
    let events = test::call_and_read_body(&app, req).await;
    let events = String::from_utf8_lossy(&events);
    assert!(events.contains("event: log\ndata: [OUT] rendering MainScene\n"));
    assert!(events.contains("event: complete\n"));

    let req = test::TestRequest::get()
        .uri(&format!("/api/video/{}/chunk?offset=6&size=3", id))
        .to_request();
    let chunk = test::call_and_read_body(&app, req).await;
    assert_eq!(&chunk[..], b"byt");

    let req = test::TestRequest::get()
        .uri("/get_chat_history")
        .cookie(cookie)
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["chat_history"].as_array().unwrap().len(), 2);
}

#[actix_web::test]
async fn failing_task_reports_error_over_sse() {
    let root = tempfile::tempdir().unwrap();
    let app = test::init_service(build_app(state_with(root.path(), Arc::new(BrokenModel)))).await;

    let req = test::TestRequest::post()
        .uri("/api/tasks")
        .set_json(json!({ "prompt": "a circle" }))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    let id = body["task_id"].as_str().unwrap().to_string();

    let mut task = Value::Null;
    for _ in 0..200 {
        let req = test::TestRequest::get()
            .uri(&format!("/api/tasks/{}", id))
            .to_request();
        task = test::call_and_read_body_json(&app, req).await;
        if task["status"] == "failed" || task["status"] == "completed" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(task["status"], "failed", "{}", task);
    assert_eq!(task["error"], "NameError: name 'BROKEN' is not defined");
    assert_eq!(task["attempts"], 3);
    assert!(task["video_url"].is_null());

    let req = test::TestRequest::get()
        .uri(&format!("/api/tasks/{}/events", id))
        .to_request();
    let events = test::call_and_read_body(&app, req).await;
    let events = String::from_utf8_lossy(&events);
    assert!(!events.contains("event: complete"));

    let frame = events
        .split("\n\n")
        .find(|frame| frame.starts_with("event: error\n"))
        .unwrap();
    let data = frame.strip_prefix("event: error\ndata: ").unwrap();
    let snapshot: Value = serde_json::from_str(data).unwrap();
    assert_eq!(snapshot["id"], id.as_str());
    assert_eq!(snapshot["status"], "failed");
    assert_eq!(snapshot["error"], "NameError: name 'BROKEN' is not defined");

    let req = test::TestRequest::get()
        .uri(&format!("/api/video/{}/chunk", id))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}
