use anyhow::{Context, Result};
use automanim::JobLog;
use automanim::api::{ProviderKind, build_model};
use automanim::config::Config;
use automanim::init;
use automanim::pipeline::Pipeline;
use automanim::quality::Quality;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "automanim-cli",
    version,
    about = "Generate and render a Manim animation from a description"
)]
struct Args {
    /// What the animation should show
    description: String,

    #[arg(long, value_enum)]
    provider: Option<ProviderKind>,

    /// Fixed render quality; chosen from scene complexity when omitted
    #[arg(long, value_enum)]
    quality: Option<Quality>,

    #[arg(long)]
    max_attempts: Option<u32>,

    #[arg(long, default_value = "config.json")]
    config: PathBuf,

    /// Print the generated script without rendering it
    #[arg(long)]
    code_only: bool,

    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let code = run(args).await?;
    std::process::exit(code);
}

async fn run(args: Args) -> Result<i32> {
    let mut cfg = Config::load(&args.config).await?;
    if let Some(n) = args.max_attempts {
        cfg.max_attempts = n;
    }
    if let Some(q) = args.quality {
        cfg.renderer.quality = Some(q);
    }
    cfg.validate()?;

    let provider = args.provider.unwrap_or(cfg.provider);
    let http = reqwest::Client::builder()
        .build()
        .context("Failed to build HTTP client")?;
    let model = build_model(&cfg, provider, http)?;

    init::ensure_directories(&cfg).await?;
    let pipeline = Arc::new(Pipeline::from_config(&cfg));
    let log = JobLog::new(Arc::new(|line: &str| eprintln!("{}", line)));

    if args.code_only {
        let script = pipeline
            .generate(model.as_ref(), &args.description, &[], &log)
            .await?;
        println!("{}", script.code);
        return Ok(0);
    }

    if !init::preflight(&cfg, false).await {
        log.warn("Continuing despite preflight warnings");
    }

    let outcome = pipeline
        .run(model.as_ref(), &args.description, &[], None, &log)
        .await?;

    if let Some(path) = &outcome.script_path {
        println!("script: {}", path.display());
    }
    match (&outcome.video, outcome.success) {
        (Some(video), true) => {
            println!("video:  {}", video.display());
            Ok(0)
        }
        _ => {
            eprintln!(
                "[ERROR] {}",
                outcome
                    .error
                    .as_deref()
                    .unwrap_or("Animation creation failed")
            );
            Ok(1)
        }
    }
}
