//! HTTP front end: pages, generation endpoints, task streaming and video files.

pub mod routes;
pub mod session;
pub mod state;

use crate::config::Config;
use crate::error::AppError;
use actix_files::{Files, NamedFile};
use actix_web::{App, HttpServer, middleware::Logger, web};
use anyhow::Context;
pub use state::AppState;
use tracing::info;

async fn index(state: web::Data<AppState>) -> Result<NamedFile, AppError> {
    let page = state.config.server.static_dir.join("index.html");
    Ok(NamedFile::open_async(page).await?)
}

/// Build the application around shared `state`.
pub fn build_app(
    state: web::Data<AppState>,
) -> App<
    impl actix_web::dev::ServiceFactory<
        actix_web::dev::ServiceRequest,
        Config = (),
        Response = actix_web::dev::ServiceResponse<impl actix_web::body::MessageBody>,
        Error = actix_web::Error,
        InitError = (),
    >,
> {
    let media_dir = state.config.renderer.media_dir.clone();
    let static_dir = state.config.server.static_dir.clone();
    let json_cfg = web::JsonConfig::default()
        .limit(256 * 1024)
        .error_handler(|err, _req| AppError::BadRequest(err.to_string()).into());

    App::new()
        .app_data(state)
        .app_data(json_cfg)
        .wrap(Logger::default())
        .route("/", web::get().to(index))
        .configure(routes::configure_routes)
        .service(Files::new("/videos", media_dir))
        .service(Files::new("/static", static_dir))
}

pub async fn run(config: Config) -> anyhow::Result<()> {
    let bind = config.server.bind.clone();
    let state = web::Data::new(AppState::from_config(config)?);

    info!("AutoManim listening on http://{}", bind);
    HttpServer::new(move || build_app(state.clone()))
        .bind(&bind)
        .with_context(|| format!("Failed to bind {}", bind))?
        .run()
        .await
        .context("HTTP server stopped with an error")
}
