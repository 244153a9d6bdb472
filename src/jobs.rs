//! Background render jobs and their streamed logs.

use crate::api::{ChatMessage, SceneModel};
use crate::history::ChatHistoryStore;
use crate::pipeline::{Pipeline, PipelineOutcome};
use crate::quality::Quality;
use crate::renderer::video_url;
use crate::{JobLog, trim_copy_utf8_safe};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use crossbeam::channel::{Receiver, Sender};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use std::sync::{Arc, Mutex};
use tracing::{error, info};

const LOG_MAX_LINES: usize = 500;
const LOG_LINE_MAX: usize = 600;
const DEFAULT_MAX_JOBS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub id: String,
    pub status: JobStatus,
    pub prompt: String,
    pub provider: String,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub video: Option<PathBuf>,
    pub video_url: Option<String>,
    pub code: Option<String>,
    pub error: Option<String>,
    pub attempts: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogChunk {
    pub lines: Vec<String>,
    pub next_cursor: usize,
    pub status: JobStatus,
}

#[derive(Debug)]
struct JobEntry {
    snapshot: JobSnapshot,
    logs: Vec<String>,
    dropped: usize,
}

/// Shared record of every job: status, outcome and a bounded log buffer.
///
/// Log cursors are absolute line numbers, so a reader that falls behind the
/// buffer simply resumes at the oldest retained line.
#[derive(Debug)]
pub struct JobBoard {
    jobs: Mutex<HashMap<String, JobEntry>>,
    media_root: PathBuf,
    max_jobs: usize,
    ttl: chrono::Duration,
}

impl JobBoard {
    pub fn new(media_root: PathBuf) -> Self {
        Self::with_retention(media_root, DEFAULT_MAX_JOBS, Duration::from_secs(3600))
    }

    /// Finished jobs are dropped once older than `ttl`, or oldest first when
    /// more than `max_jobs` are held. Queued and running jobs are never dropped.
    pub fn with_retention(media_root: PathBuf, max_jobs: usize, ttl: Duration) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            media_root,
            max_jobs: max_jobs.max(1),
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX),
        }
    }

    fn evict_finished(&self, jobs: &mut HashMap<String, JobEntry>, now: DateTime<Utc>) {
        jobs.retain(|_, entry| match entry.snapshot.finished_at {
            Some(finished) => now.signed_duration_since(finished) < self.ttl,
            None => true,
        });

        while jobs.len() >= self.max_jobs {
            let oldest = jobs
                .values()
                .filter_map(|entry| {
                    entry
                        .snapshot
                        .finished_at
                        .map(|finished| (finished, entry.snapshot.created_at, entry.snapshot.id.clone()))
                })
                .min();
            match oldest {
                Some((_, _, id)) => {
                    jobs.remove(&id);
                }
                None => break,
            }
        }
    }

    fn with_entry<T>(&self, id: &str, f: impl FnOnce(&mut JobEntry) -> T) -> Option<T> {
        let mut guard = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        guard.get_mut(id).map(f)
    }

    pub fn create(&self, prompt: &str, provider: &str) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let entry = JobEntry {
            snapshot: JobSnapshot {
                id: id.clone(),
                status: JobStatus::Queued,
                prompt: prompt.to_string(),
                provider: provider.to_string(),
                created_at: Utc::now(),
                finished_at: None,
                video: None,
                video_url: None,
                code: None,
                error: None,
                attempts: 0,
            },
            logs: Vec::new(),
            dropped: 0,
        };
        let mut guard = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        self.evict_finished(&mut guard, Utc::now());
        guard.insert(id.clone(), entry);
        id
    }

    pub fn mark_running(&self, id: &str) {
        self.with_entry(id, |entry| entry.snapshot.status = JobStatus::Running);
    }

    pub fn push_log(&self, id: &str, line: &str) {
        self.with_entry(id, |entry| {
            if entry.logs.len() >= LOG_MAX_LINES {
                let excess = entry.logs.len() + 1 - LOG_MAX_LINES;
                entry.logs.drain(0..excess);
                entry.dropped += excess;
            }
            entry.logs.push(trim_copy_utf8_safe(line, LOG_LINE_MAX));
        });
    }

    pub fn complete(&self, id: &str, outcome: &PipelineOutcome) {
        let url = outcome
            .video
            .as_deref()
            .and_then(|video| video_url(&self.media_root, video));
        self.with_entry(id, |entry| {
            let snap = &mut entry.snapshot;
            snap.status = if outcome.success {
                JobStatus::Completed
            } else {
                JobStatus::Failed
            };
            snap.finished_at = Some(Utc::now());
            snap.video = outcome.video.clone();
            snap.video_url = url;
            snap.code = Some(outcome.script.code.clone());
            snap.error = outcome.error.clone();
            snap.attempts = outcome.attempts.len();
        });
    }

    pub fn fail(&self, id: &str, message: &str) {
        self.with_entry(id, |entry| {
            entry.snapshot.status = JobStatus::Failed;
            entry.snapshot.finished_at = Some(Utc::now());
            entry.snapshot.error = Some(message.to_string());
        });
    }

    pub fn snapshot(&self, id: &str) -> Option<JobSnapshot> {
        self.with_entry(id, |entry| entry.snapshot.clone())
    }

    pub fn logs_since(&self, id: &str, cursor: usize) -> Option<LogChunk> {
        self.with_entry(id, |entry| {
            let start = cursor.saturating_sub(entry.dropped).min(entry.logs.len());
            LogChunk {
                lines: entry.logs[start..].to_vec(),
                next_cursor: entry.dropped + entry.logs.len(),
                status: entry.snapshot.status,
            }
        })
    }
}

pub struct JobRequest {
    pub id: String,
    pub prompt: String,
    pub history: Vec<ChatMessage>,
    pub session: Option<String>,
    pub quality: Option<Quality>,
    pub model: Arc<dyn SceneModel>,
}

/// Fixed pool of render workers fed through a channel.
#[derive(Clone)]
pub struct JobQueue {
    sender: Sender<JobRequest>,
    board: Arc<JobBoard>,
}

impl JobQueue {
    pub fn start(
        workers: usize,
        pipeline: Arc<Pipeline>,
        board: Arc<JobBoard>,
        history: Arc<ChatHistoryStore>,
    ) -> Result<Self> {
        let (sender, receiver) = crossbeam::channel::unbounded::<JobRequest>();

        for index in 0..workers.max(1) {
            let receiver = receiver.clone();
            let pipeline = Arc::clone(&pipeline);
            let board = Arc::clone(&board);
            let history = Arc::clone(&history);
            std::thread::Builder::new()
                .name(format!("render-worker-{}", index))
                .spawn(move || worker_loop(receiver, pipeline, board, history))
                .context("Failed to spawn render worker")?;
        }

        Ok(Self { sender, board })
    }

    pub fn board(&self) -> &Arc<JobBoard> {
        &self.board
    }

    pub fn submit(
        &self,
        prompt: &str,
        session: Option<String>,
        history: Vec<ChatMessage>,
        quality: Option<Quality>,
        model: Arc<dyn SceneModel>,
    ) -> Result<String> {
        let id = self.board.create(prompt, model.name());
        let request = JobRequest {
            id: id.clone(),
            prompt: prompt.to_string(),
            history,
            session,
            quality,
            model,
        };

        if self.sender.send(request).is_err() {
            self.board.fail(&id, "render workers are not running");
            anyhow::bail!("render workers are not running");
        }
        info!(job = %id, "queued render job");
        Ok(id)
    }
}

fn worker_loop(
    receiver: Receiver<JobRequest>,
    pipeline: Arc<Pipeline>,
    board: Arc<JobBoard>,
    history: Arc<ChatHistoryStore>,
) {
    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(err) => {
            error!("render worker could not start its runtime: {}", err);
            return;
        }
    };

    while let Ok(request) = receiver.recv() {
        run_job(&rt, &pipeline, &board, &history, request);
    }
}

fn run_job(
    rt: &tokio::runtime::Runtime,
    pipeline: &Pipeline,
    board: &Arc<JobBoard>,
    history: &ChatHistoryStore,
    request: JobRequest,
) {
    board.mark_running(&request.id);

    let hook_board = Arc::clone(board);
    let hook_id = request.id.clone();
    let log = JobLog::new(Arc::new(move |line: &str| {
        hook_board.push_log(&hook_id, line);
    }));

    let result = rt.block_on(pipeline.run(
        request.model.as_ref(),
        &request.prompt,
        &request.history,
        request.quality,
        &log,
    ));

    match result {
        Ok(outcome) => {
            if outcome.success {
                if let Some(session) = request.session.as_deref() {
                    history.append(
                        session,
                        [
                            ChatMessage::user(request.prompt.clone()),
                            ChatMessage::assistant(outcome.script.code.clone()),
                        ],
                    );
                }
            }
            board.complete(&request.id, &outcome);
        }
        Err(err) => {
            log.warn(format!("Job failed: {}", err));
            board.fail(&request.id, &err.to_string());
        }
    }
}
