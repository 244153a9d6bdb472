use crate::api::{ProviderKind, SceneModel, build_model};
use crate::config::Config;
use crate::error::{AppError, Result};
use crate::history::ChatHistoryStore;
use crate::jobs::{JobBoard, JobQueue};
use crate::pipeline::Pipeline;
use anyhow::Context;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Everything a request handler needs.
pub struct AppState {
    pub config: Arc<Config>,
    pub pipeline: Arc<Pipeline>,
    pub jobs: JobQueue,
    pub history: Arc<ChatHistoryStore>,
    models: HashMap<ProviderKind, Arc<dyn SceneModel>>,
}

impl AppState {
    pub fn new(
        config: Config,
        models: HashMap<ProviderKind, Arc<dyn SceneModel>>,
    ) -> anyhow::Result<Self> {
        // Files services resolve their root once, at app build time.
        for dir in [&config.renderer.media_dir, &config.server.static_dir] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }

        let pipeline = Arc::new(Pipeline::from_config(&config));
        let history = Arc::new(ChatHistoryStore::with_retention(
            config.server.history_limit,
            config.server.max_sessions,
            config.session_ttl(),
        ));
        let board = Arc::new(JobBoard::with_retention(
            config.renderer.media_dir.clone(),
            config.server.max_jobs,
            config.job_ttl(),
        ));
        let jobs = JobQueue::start(
            config.server.workers,
            Arc::clone(&pipeline),
            board,
            Arc::clone(&history),
        )?;

        Ok(Self {
            config: Arc::new(config),
            pipeline,
            jobs,
            history,
            models,
        })
    }

    /// Build a client for every provider that has a key.
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;

        let mut models: HashMap<ProviderKind, Arc<dyn SceneModel>> = HashMap::new();
        for kind in [ProviderKind::Groq, ProviderKind::Gemini] {
            match build_model(&config, kind, http.clone()) {
                Ok(model) => {
                    info!("Provider {} ready", kind);
                    models.insert(kind, model);
                }
                Err(err) => warn!("Provider {} unavailable: {}", kind, err),
            }
        }
        if models.is_empty() {
            warn!("No LLM provider configured; set GROQ_API_KEY or GEMINI_API_KEY");
        }

        Self::new(config, models)
    }

    pub fn providers(&self) -> Vec<ProviderKind> {
        let mut kinds: Vec<ProviderKind> = self.models.keys().copied().collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }

    /// The requested provider, or the configured default, or whichever is available.
    pub fn model(&self, requested: Option<ProviderKind>) -> Result<Arc<dyn SceneModel>> {
        if let Some(kind) = requested {
            return self
                .models
                .get(&kind)
                .cloned()
                .ok_or_else(|| AppError::ProviderUnavailable(kind.to_string()));
        }

        self.models
            .get(&self.config.provider)
            .or_else(|| self.models.values().next())
            .cloned()
            .ok_or_else(|| AppError::ProviderUnavailable(self.config.provider.to_string()))
    }
}
