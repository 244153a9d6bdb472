//! Prompt → script → render, with model-driven repair of failed renders.

use crate::JobLog;
use crate::api::{ChatMessage, SceneModel};
use crate::config::Config;
use crate::diagnostics::{RenderDiagnostic, parse_render_error};
use crate::error::{AppError, Result};
use crate::extract::{SceneScript, extract_scene_script};
use crate::prompts::{CODE_ONLY_REMINDER, FIX_INSTRUCTION, SYSTEM_INSTRUCTION, fix_prompt};
use crate::quality::{Quality, choose_quality, complexity_score};
use crate::renderer::Renderer;
use anyhow::Context;
use serde::Serialize;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::fs;

#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub script_path: PathBuf,
    pub quality: Quality,
    pub success: bool,
    pub diagnostic: Option<RenderDiagnostic>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutcome {
    pub success: bool,
    pub script: SceneScript,
    pub script_path: Option<PathBuf>,
    pub video: Option<PathBuf>,
    pub attempts: Vec<AttemptRecord>,
    pub error: Option<String>,
}

/// How long a finished render may be handed out again for identical code.
const RENDER_CACHE_TTL: Duration = Duration::from_secs(3600);
const RENDER_CACHE_MAX: usize = 64;

type RenderKey = (String, Option<Quality>);

#[derive(Debug, Clone)]
struct CachedRender {
    script: SceneScript,
    script_path: PathBuf,
    video: PathBuf,
    at: Instant,
}

#[derive(Debug)]
pub struct Pipeline {
    renderer: Renderer,
    scripts_dir: PathBuf,
    max_attempts: u32,
    quality: Option<Quality>,
    rendered: Mutex<HashMap<RenderKey, CachedRender>>,
}

impl Pipeline {
    pub fn new(
        renderer: Renderer,
        scripts_dir: PathBuf,
        max_attempts: u32,
        quality: Option<Quality>,
    ) -> Self {
        Self {
            renderer,
            scripts_dir,
            max_attempts: max_attempts.max(1),
            quality,
            rendered: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(
            Renderer::from_config(&cfg.renderer),
            cfg.renderer.scripts_dir.clone(),
            cfg.max_attempts,
            cfg.renderer.quality,
        )
    }

    pub fn renderer(&self) -> &Renderer {
        &self.renderer
    }

    pub fn media_dir(&self) -> &Path {
        self.renderer.media_dir()
    }

    fn cached_render(&self, key: &RenderKey) -> Option<CachedRender> {
        let mut cache = self.rendered.lock().unwrap_or_else(|e| e.into_inner());
        let hit = cache.get(key)?.clone();
        if hit.at.elapsed() < RENDER_CACHE_TTL && hit.video.is_file() {
            Some(hit)
        } else {
            cache.remove(key);
            None
        }
    }

    fn remember_render(&self, key: RenderKey, render: CachedRender) {
        let mut cache = self.rendered.lock().unwrap_or_else(|e| e.into_inner());
        cache.retain(|_, r| r.at.elapsed() < RENDER_CACHE_TTL);
        if cache.len() >= RENDER_CACHE_MAX {
            let oldest = cache
                .iter()
                .min_by_key(|(_, r)| r.at)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                cache.remove(&oldest);
            }
        }
        cache.insert(key, render);
    }

    /// Persist `script` under a fresh `scene_*.py` name in the scripts dir.
    pub async fn write_script(&self, script: &SceneScript) -> Result<PathBuf> {
        fs::create_dir_all(&self.scripts_dir)
            .await
            .with_context(|| format!("Failed to create {}", self.scripts_dir.display()))?;

        let dir = self.scripts_dir.clone();
        let code = script.code.clone();
        let path = tokio::task::spawn_blocking(move || -> anyhow::Result<PathBuf> {
            let mut file = tempfile::Builder::new()
                .prefix("scene_")
                .suffix(".py")
                .rand_bytes(8)
                .tempfile_in(&dir)
                .with_context(|| format!("Failed to create script in {}", dir.display()))?;
            file.write_all(code.as_bytes())?;
            file.flush()?;
            let (_, path) = file.keep().context("Failed to keep script file")?;
            Ok(path)
        })
        .await
        .context("Script writer task failed")??;

        Ok(path)
    }

    /// Ask the model for a scene, reprompting once if the reply holds no scene class.
    pub async fn generate(
        &self,
        model: &dyn SceneModel,
        prompt: &str,
        history: &[ChatMessage],
        log: &JobLog,
    ) -> Result<SceneScript> {
        log.info(format!("Requesting scene script from {}...", model.name()));
        let reply = model.complete(SYSTEM_INSTRUCTION, history, prompt).await?;
        if let Some(script) = extract_scene_script(&reply) {
            log.ok(format!(
                "Received scene {} ({} bytes)",
                script.scene_name,
                script.code.len()
            ));
            return Ok(script);
        }

        log.warn("Reply contained no scene class; asking again for code only");
        let mut retry_history = history.to_vec();
        retry_history.push(ChatMessage::user(prompt));
        retry_history.push(ChatMessage::assistant(reply));

        let reply = model
            .complete(SYSTEM_INSTRUCTION, &retry_history, CODE_ONLY_REMINDER)
            .await?;
        let script = extract_scene_script(&reply).ok_or(AppError::NoScript)?;
        log.ok(format!("Received scene {} on reprompt", script.scene_name));
        Ok(script)
    }

    async fn request_fix(
        &self,
        model: &dyn SceneModel,
        script: &SceneScript,
        diagnostic: &RenderDiagnostic,
    ) -> Result<Option<SceneScript>> {
        let prompt = fix_prompt(&script.code, diagnostic);
        let reply = model.complete(FIX_INSTRUCTION, &[], &prompt).await?;
        Ok(extract_scene_script(&reply))
    }

    /// Render `script`, feeding failures back to the model until it renders or
    /// the attempt budget runs out.
    pub async fn render_with_repair(
        &self,
        model: &dyn SceneModel,
        script: SceneScript,
        quality: Option<Quality>,
        log: &JobLog,
    ) -> Result<PipelineOutcome> {
        let key: RenderKey = (script.code.clone(), quality.or(self.quality));
        if let Some(hit) = self.cached_render(&key) {
            log.ok(format!("Reusing earlier render: {}", hit.video.display()));
            return Ok(PipelineOutcome {
                success: true,
                script: hit.script,
                script_path: Some(hit.script_path),
                video: Some(hit.video),
                attempts: Vec::new(),
                error: None,
            });
        }

        let mut current = script;
        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut last_path: Option<PathBuf> = None;
        let mut last_error: Option<String> = None;

        for attempt in 1..=self.max_attempts {
            let path = self.write_script(&current).await?;
            last_path = Some(path.clone());

            let chosen = choose_quality(complexity_score(&current.code), quality.or(self.quality));
            log.info(format!(
                "Attempt {}/{}: rendering {} at {} from {}",
                attempt,
                self.max_attempts,
                current.scene_name,
                chosen,
                path.display()
            ));

            let output = self
                .renderer
                .render(&path, &current.scene_name, chosen, log)
                .await?;

            if output.success {
                if let Some(video) = output.video {
                    log.ok(format!(
                        "Rendered on attempt {}: {}",
                        attempt,
                        video.display()
                    ));
                    attempts.push(AttemptRecord {
                        attempt,
                        script_path: path.clone(),
                        quality: chosen,
                        success: true,
                        diagnostic: None,
                    });
                    self.remember_render(
                        key,
                        CachedRender {
                            script: current.clone(),
                            script_path: path.clone(),
                            video: video.clone(),
                            at: Instant::now(),
                        },
                    );
                    return Ok(PipelineOutcome {
                        success: true,
                        script: current,
                        script_path: Some(path),
                        video: Some(video),
                        attempts,
                        error: None,
                    });
                }

                let message = format!(
                    "Renderer finished but no video for {} was found under {}",
                    current.scene_name,
                    self.media_dir().display()
                );
                log.warn(&message);
                attempts.push(AttemptRecord {
                    attempt,
                    script_path: path,
                    quality: chosen,
                    success: false,
                    diagnostic: None,
                });
                last_error = Some(message);
                break;
            }

            let diagnostic = parse_render_error(&output.failure_text());
            let headline = diagnostic.headline();
            log.warn(format!("Attempt {} failed: {}", attempt, headline));
            attempts.push(AttemptRecord {
                attempt,
                script_path: path,
                quality: chosen,
                success: false,
                diagnostic: Some(diagnostic.clone()),
            });
            last_error = Some(headline);

            if attempt == self.max_attempts {
                break;
            }

            log.info(format!("Sending error to {} for correction...", model.name()));
            match self.request_fix(model, &current, &diagnostic).await {
                Ok(Some(fixed)) => current = fixed,
                Ok(None) => {
                    log.warn("Correction reply contained no scene script; giving up");
                    break;
                }
                Err(err) => {
                    log.warn(format!("Correction request failed: {}", err));
                    last_error = Some(err.to_string());
                    break;
                }
            }
        }

        log.warn(format!(
            "No working scene after {} attempt(s)",
            attempts.len()
        ));
        Ok(PipelineOutcome {
            success: false,
            script: current,
            script_path: last_path,
            video: None,
            attempts,
            error: last_error,
        })
    }

    pub async fn run(
        &self,
        model: &dyn SceneModel,
        prompt: &str,
        history: &[ChatMessage],
        quality: Option<Quality>,
        log: &JobLog,
    ) -> Result<PipelineOutcome> {
        let script = self.generate(model, prompt, history, log).await?;
        self.render_with_repair(model, script, quality, log).await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    const GOOD: &str = "from manim import *\nclass MainScene(Scene):\n    def construct(self):\n        self.play(Create(Circle()))\n";
    const BROKEN: &str = "from manim import *\nclass MainScene(Scene):\n    def construct(self):\n        self.play(Create(BROKEN()))\n";

    // argv: -q <q> --media_dir <media> <script> <scene>
    const FAKE_RENDERER: &str = r#"if grep -q BROKEN "$5"; then echo "Traceback (most recent call last):" >&2; echo "NameError: name 'BROKEN' is not defined" >&2; exit 1; fi
stem=$(basename "$5" .py); out="$4/videos/$stem/480p15"; mkdir -p "$out"; printf data > "$out/$6.mp4""#;

    struct ScriptedModel {
        replies: Mutex<VecDeque<Result<String>>>,
        prompts: Mutex<Vec<(String, String)>>,
    }

    impl ScriptedModel {
        fn new(replies: Vec<Result<String>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                prompts: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<(String, String)> {
            self.prompts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SceneModel for ScriptedModel {
        fn name(&self) -> &'static str {
            "Scripted"
        }

        async fn complete(
            &self,
            system: &str,
            _history: &[ChatMessage],
            prompt: &str,
        ) -> Result<String> {
            self.prompts
                .lock()
                .unwrap()
                .push((system.to_string(), prompt.to_string()));
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(AppError::EmptyReply("Scripted")))
        }
    }

    fn pipeline(root: &Path, max_attempts: u32) -> Pipeline {
        let renderer = Renderer::new(
            vec![
                "sh".into(),
                "-c".into(),
                FAKE_RENDERER.into(),
                "renderer".into(),
            ],
            Vec::new(),
            root.join("media"),
            Duration::from_secs(10),
        );
        Pipeline::new(renderer, root.join("scenes"), max_attempts, Some(Quality::Low))
    }

    #[tokio::test]
    async fn first_render_succeeds() {
        let root = tempfile::tempdir().unwrap();
        let model = ScriptedModel::new(vec![Ok(format!("```python\n{GOOD}```"))]);

        let outcome = pipeline(root.path(), 3)
            .run(&model, "a circle", &[], None, &JobLog::silent())
            .await
            .unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.attempts.len(), 1);
        let video = outcome.video.unwrap();
        assert!(video.ends_with("480p15/MainScene.mp4"));
        assert!(video.starts_with(root.path().join("media/videos")));
        let written = std::fs::read_to_string(outcome.script_path.unwrap()).unwrap();
        assert_eq!(written, GOOD);
    }

    #[tokio::test]
    async fn failed_render_is_repaired_by_model() {
        let root = tempfile::tempdir().unwrap();
        let model = ScriptedModel::new(vec![Ok(BROKEN.to_string()), Ok(GOOD.to_string())]);

        let outcome = pipeline(root.path(), 3)
            .run(&model, "a circle", &[], None, &JobLog::silent())
            .await
            .unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.attempts.len(), 2);
        let first = outcome.attempts[0].diagnostic.as_ref().unwrap();
        assert_eq!(first.error_type.as_deref(), Some("NameError"));

        let calls = model.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].0, FIX_INSTRUCTION);
        assert!(calls[1].1.contains("Error Message: name 'BROKEN' is not defined"));
        assert!(calls[1].1.contains("Create(BROKEN())"));
    }

    #[tokio::test]
    async fn attempts_are_bounded() {
        let root = tempfile::tempdir().unwrap();
        let model = ScriptedModel::new(vec![
            Ok(BROKEN.to_string()),
            Ok(BROKEN.to_string()),
            Ok(BROKEN.to_string()),
            Ok(GOOD.to_string()),
        ]);

        let outcome = pipeline(root.path(), 3)
            .run(&model, "a circle", &[], None, &JobLog::silent())
            .await
            .unwrap();

        assert!(!outcome.success);
        assert_eq!(outcome.attempts.len(), 3);
        assert_eq!(model.calls().len(), 3);
        assert_eq!(
            outcome.error.as_deref(),
            Some("NameError: name 'BROKEN' is not defined")
        );
    }

    #[tokio::test]
    async fn unusable_fix_stops_the_loop() {
        let root = tempfile::tempdir().unwrap();
        let model = ScriptedModel::new(vec![
            Ok(BROKEN.to_string()),
            Ok("Sorry, I can't fix that.".to_string()),
        ]);

        let outcome = pipeline(root.path(), 3)
            .run(&model, "a circle", &[], None, &JobLog::silent())
            .await
            .unwrap();

        assert!(!outcome.success);
        assert_eq!(outcome.attempts.len(), 1);
        assert!(outcome.script.code.contains("BROKEN"));
    }

    #[tokio::test]
    async fn prose_reply_triggers_one_reprompt() {
        let root = tempfile::tempdir().unwrap();
        let model = ScriptedModel::new(vec![
            Ok("I'd be happy to help with a circle!".to_string()),
            Ok(GOOD.to_string()),
        ]);

        let script = pipeline(root.path(), 1)
            .generate(&model, "a circle", &[], &JobLog::silent())
            .await
            .unwrap();
        assert_eq!(script.scene_name, "MainScene");
        assert_eq!(model.calls()[1].1, CODE_ONLY_REMINDER);

        let model = ScriptedModel::new(vec![Ok("no".into()), Ok("still no".into())]);
        let err = pipeline(root.path(), 1)
            .generate(&model, "a circle", &[], &JobLog::silent())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NoScript));
    }

    #[tokio::test]
    async fn identical_code_reuses_the_earlier_render() {
        let root = tempfile::tempdir().unwrap();
        let p = pipeline(root.path(), 2);
        let model = ScriptedModel::new(Vec::new());
        let script = SceneScript {
            code: GOOD.to_string(),
            scene_name: "MainScene".to_string(),
        };

        let first = p
            .render_with_repair(&model, script.clone(), None, &JobLog::silent())
            .await
            .unwrap();
        let again = p
            .render_with_repair(&model, script.clone(), None, &JobLog::silent())
            .await
            .unwrap();

        assert!(again.success);
        assert!(again.attempts.is_empty());
        assert_eq!(again.video, first.video);
        assert_eq!(std::fs::read_dir(root.path().join("scenes")).unwrap().count(), 1);

        // a vanished video is rendered afresh
        std::fs::remove_file(first.video.as_ref().unwrap()).unwrap();
        let fresh = p
            .render_with_repair(&model, script, None, &JobLog::silent())
            .await
            .unwrap();
        assert_eq!(fresh.attempts.len(), 1);
        assert_eq!(std::fs::read_dir(root.path().join("scenes")).unwrap().count(), 2);
    }

    #[tokio::test]
    async fn scripts_get_unique_names() {
        let root = tempfile::tempdir().unwrap();
        let p = pipeline(root.path(), 1);
        let script = SceneScript {
            code: GOOD.to_string(),
            scene_name: "MainScene".to_string(),
        };
        let a = p.write_script(&script).await.unwrap();
        let b = p.write_script(&script).await.unwrap();
        assert_ne!(a, b);
        let name = a.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("scene_") && name.ends_with(".py"));
    }
}
