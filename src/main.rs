use anyhow::Result;
use automanim::config::Config;
use automanim::{init, server};
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "automanim", version, about = "Text-to-animation web server")]
struct Args {
    /// JSON config file; defaults apply when it is missing
    #[arg(long, default_value = "config.json")]
    config: PathBuf,

    /// Override the listen address
    #[arg(long)]
    bind: Option<String>,

    #[arg(short, long)]
    verbose: bool,
}

#[actix_web::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let mut cfg = Config::load(&args.config).await?;
    if let Some(bind) = args.bind {
        cfg.server.bind = bind;
    }

    init::ensure_directories(&cfg).await?;
    init::preflight(&cfg, true).await;

    server::run(cfg).await
}
