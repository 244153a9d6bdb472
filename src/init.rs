use crate::config::Config;
use crate::renderer::check_renderer;
use anyhow::{Context, Result};
use std::path::Path;
use tokio::fs;
use tracing::{info, warn};

pub async fn ensure_directories(cfg: &Config) -> Result<()> {
    let required = [
        cfg.renderer.media_dir.as_path(),
        cfg.renderer.scripts_dir.as_path(),
    ];
    for dir in required {
        if !dir.exists() {
            fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create directory {}", dir.display()))?;
            info!("Created directory: {}", dir.display());
        }
    }
    Ok(())
}

/// Warn about anything that will make requests fail later.
pub async fn preflight(cfg: &Config, serving: bool) -> bool {
    let mut ok = true;

    if !check_renderer(&cfg.renderer.command).await {
        warn!(
            "Renderer `{}` not found or not runnable. Install Manim or set renderer.command.",
            cfg.renderer.command.join(" ")
        );
        ok = false;
    }

    if cfg.api_key(cfg.provider).is_none() {
        warn!(
            "{} is not set; the {} provider cannot be used",
            cfg.provider.key_var(),
            cfg.provider
        );
        ok = false;
    }

    if serving && !Path::new(&cfg.server.static_dir).join("index.html").exists() {
        warn!(
            "No index.html in {}; the web page will not load",
            cfg.server.static_dir.display()
        );
        ok = false;
    }

    ok
}
