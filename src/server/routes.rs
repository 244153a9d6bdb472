use super::session::Session;
use super::state::AppState;
use crate::JobLog;
use crate::api::{ChatMessage, ProviderKind};
use crate::error::{AppError, Result};
use crate::extract::extract_scene_script;
use crate::jobs::JobStatus;
use crate::quality::Quality;
use crate::renderer::video_url;
use actix_web::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use actix_web::{HttpResponse, web};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::io::SeekFrom;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info};

const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(250);
const DEFAULT_CHUNK: u64 = 1024 * 1024;
const MAX_CHUNK: u64 = 8 * 1024 * 1024;

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health))
        .route("/generate_manim_code", web::post().to(generate_code))
        .route("/execute_manim", web::post().to(execute_code))
        .route("/get_chat_history", web::get().to(chat_history))
        .route("/clear_chat_history", web::post().to(clear_chat_history))
        .service(
            web::scope("/api")
                .route("/tasks", web::post().to(create_task))
                .route("/tasks/{id}", web::get().to(task_status))
                .route("/tasks/{id}/logs", web::get().to(task_logs))
                .route("/tasks/{id}/events", web::get().to(task_events))
                .route("/video/{id}/chunk", web::get().to(video_chunk)),
        );
}

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    #[serde(rename = "manimPrompt", alias = "prompt")]
    pub prompt: String,
    #[serde(default)]
    pub provider: Option<ProviderKind>,
    #[serde(default)]
    pub quality: Option<Quality>,
}

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    pub code: String,
    #[serde(default)]
    pub provider: Option<ProviderKind>,
    #[serde(default)]
    pub quality: Option<Quality>,
}

#[derive(Debug, Deserialize)]
pub struct LogQuery {
    #[serde(default)]
    pub cursor: usize,
}

#[derive(Debug, Deserialize)]
pub struct ChunkQuery {
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub size: Option<u64>,
}

fn required_prompt(prompt: &str) -> Result<&str> {
    let prompt = prompt.trim();
    if prompt.is_empty() {
        return Err(AppError::BadRequest(
            "Please describe the animation you want to create".to_string(),
        ));
    }
    Ok(prompt)
}

async fn health(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "providers": state.providers(),
        "renderer": state.config.renderer.command.first(),
    }))
}

async fn generate_code(
    state: web::Data<AppState>,
    session: Session,
    body: web::Json<GenerateRequest>,
) -> Result<HttpResponse> {
    let prompt = required_prompt(&body.prompt)?;
    let model = state.model(body.provider)?;
    let history = state.history.get(&session.id);

    let script = state
        .pipeline
        .generate(model.as_ref(), prompt, &history, &JobLog::silent())
        .await?;

    state.history.append(
        &session.id,
        [
            ChatMessage::user(prompt),
            ChatMessage::assistant(script.code.clone()),
        ],
    );

    Ok(session.attach(&mut HttpResponse::Ok()).json(json!({
        "code": script.code,
        "scene_name": script.scene_name,
    })))
}

async fn execute_code(
    state: web::Data<AppState>,
    session: Session,
    body: web::Json<ExecuteRequest>,
) -> Result<HttpResponse> {
    if body.code.trim().is_empty() {
        return Err(AppError::BadRequest("No code to execute".to_string()));
    }
    let script = extract_scene_script(&body.code).ok_or_else(|| {
        AppError::BadRequest("The code does not define a Manim Scene class".to_string())
    })?;
    let model = state.model(body.provider)?;

    let outcome = state
        .pipeline
        .render_with_repair(model.as_ref(), script, body.quality, &JobLog::silent())
        .await?;

    let url = outcome
        .video
        .as_deref()
        .and_then(|video| video_url(state.pipeline.media_dir(), video));

    if outcome.success && outcome.attempts.len() > 1 {
        state.history.append(
            &session.id,
            [ChatMessage::assistant(outcome.script.code.clone())],
        );
    }

    let (status, message) = if outcome.success {
        ("success", "Animation generated successfully!".to_string())
    } else {
        (
            "error",
            outcome
                .error
                .clone()
                .unwrap_or_else(|| "Animation creation failed".to_string()),
        )
    };

    Ok(session.attach(&mut HttpResponse::Ok()).json(json!({
        "status": status,
        "message": message,
        "video_url": url,
        "code": outcome.script.code,
        "attempts": outcome.attempts,
    })))
}

async fn chat_history(state: web::Data<AppState>, session: Session) -> HttpResponse {
    let history = state.history.get(&session.id);
    session
        .attach(&mut HttpResponse::Ok())
        .json(json!({ "chat_history": history }))
}

async fn clear_chat_history(state: web::Data<AppState>, session: Session) -> HttpResponse {
    state.history.clear(&session.id);
    session
        .attach(&mut HttpResponse::Ok())
        .json(json!({ "status": "success" }))
}

async fn create_task(
    state: web::Data<AppState>,
    session: Session,
    body: web::Json<GenerateRequest>,
) -> Result<HttpResponse> {
    let prompt = required_prompt(&body.prompt)?;
    let model = state.model(body.provider)?;
    let history = state.history.get(&session.id);

    let id = state.jobs.submit(
        prompt,
        Some(session.id.clone()),
        history,
        body.quality,
        model,
    )?;
    info!(task = %id, "accepted animation task");

    Ok(session.attach(&mut HttpResponse::Accepted()).json(json!({
        "task_id": id,
        "status": JobStatus::Queued,
        "status_url": format!("/api/tasks/{}", id),
        "events_url": format!("/api/tasks/{}/events", id),
    })))
}

async fn task_status(state: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse> {
    let id = path.into_inner();
    let snapshot = state
        .jobs
        .board()
        .snapshot(&id)
        .ok_or(AppError::TaskNotFound(id))?;
    Ok(HttpResponse::Ok().json(snapshot))
}

async fn task_logs(
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<LogQuery>,
) -> Result<HttpResponse> {
    let id = path.into_inner();
    let chunk = state
        .jobs
        .board()
        .logs_since(&id, query.cursor)
        .ok_or(AppError::TaskNotFound(id))?;
    Ok(HttpResponse::Ok().json(chunk))
}

/// One server-sent event; multi-line data becomes several `data:` fields.
pub(crate) fn sse_event(event: &str, data: &str) -> web::Bytes {
    let mut frame = format!("event: {}\n", event);
    for line in data.split('\n') {
        frame.push_str("data: ");
        frame.push_str(line.trim_end_matches('\r'));
        frame.push('\n');
    }
    frame.push('\n');
    web::Bytes::from(frame)
}

async fn task_events(state: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse> {
    let id = path.into_inner();
    let board = Arc::clone(state.jobs.board());
    if board.snapshot(&id).is_none() {
        return Err(AppError::TaskNotFound(id));
    }
    debug!(task = %id, "streaming task events");

    let events = async_stream::stream! {
        let mut cursor = 0usize;
        let mut ticker = tokio::time::interval(EVENT_POLL_INTERVAL);
        loop {
            ticker.tick().await;
            let Some(chunk) = board.logs_since(&id, cursor) else {
                yield Ok::<_, Infallible>(sse_event("error", "task no longer exists"));
                break;
            };
            cursor = chunk.next_cursor;
            for line in &chunk.lines {
                yield Ok(sse_event("log", line));
            }
            if chunk.status.is_finished() {
                if let Some(snapshot) = board.snapshot(&id) {
                    let name = if snapshot.status == JobStatus::Completed {
                        "complete"
                    } else {
                        "error"
                    };
                    let data = serde_json::to_string(&snapshot).unwrap_or_default();
                    yield Ok(sse_event(name, &data));
                }
                break;
            }
        }
    };

    Ok(HttpResponse::Ok()
        .insert_header((CONTENT_TYPE, "text/event-stream"))
        .insert_header((CACHE_CONTROL, "no-cache"))
        .streaming(events))
}

async fn video_chunk(
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<ChunkQuery>,
) -> Result<HttpResponse> {
    let id = path.into_inner();
    let snapshot = state
        .jobs
        .board()
        .snapshot(&id)
        .ok_or_else(|| AppError::TaskNotFound(id.clone()))?;
    let video = snapshot
        .video
        .ok_or_else(|| AppError::BadRequest(format!("task {} has no video yet", id)))?;

    let size = query.size.unwrap_or(DEFAULT_CHUNK).clamp(1, MAX_CHUNK);
    let mut file = tokio::fs::File::open(&video).await?;
    let len = file.metadata().await?.len();
    if query.offset >= len {
        return Ok(HttpResponse::Ok().content_type("video/mp4").body(Vec::new()));
    }

    file.seek(SeekFrom::Start(query.offset)).await?;
    let mut buf = Vec::with_capacity(size.min(len - query.offset) as usize);
    file.take(size).read_to_end(&mut buf).await?;

    Ok(HttpResponse::Ok().content_type("video/mp4").body(buf))
}
