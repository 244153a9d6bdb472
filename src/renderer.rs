use crate::JobLog;
use crate::config::RendererConfig;
use crate::quality::Quality;
use anyhow::{Context, Result};
use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use walkdir::WalkDir;

/// Tolerance for coarse filesystem timestamps when matching fresh output.
const MTIME_SLACK: Duration = Duration::from_secs(2);
const PARTIAL_DIR: &str = "partial_movie_files";
/// How long output pumps may run on once the renderer itself is gone.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct Renderer {
    command: Vec<String>,
    extra_args: Vec<String>,
    media_dir: PathBuf,
    timeout: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct RenderOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub stdout: String,
    pub stderr: String,
    pub video: Option<PathBuf>,
}

impl RenderOutput {
    /// Error text for diagnostics; stderr first since tracebacks land there.
    pub fn failure_text(&self) -> String {
        match (self.stderr.trim().is_empty(), self.stdout.trim().is_empty()) {
            (false, _) => self.stderr.clone(),
            (true, false) => self.stdout.clone(),
            (true, true) => match self.exit_code {
                Some(code) => format!("renderer exited with status {}", code),
                None => "renderer terminated without output".to_string(),
            },
        }
    }
}

impl Renderer {
    pub fn new(
        command: Vec<String>,
        extra_args: Vec<String>,
        media_dir: PathBuf,
        timeout: Duration,
    ) -> Self {
        Self {
            command,
            extra_args,
            media_dir,
            timeout,
        }
    }

    pub fn from_config(cfg: &RendererConfig) -> Self {
        Self::new(
            cfg.command.clone(),
            cfg.extra_args.clone(),
            cfg.media_dir.clone(),
            Duration::from_secs(cfg.timeout_secs),
        )
    }

    pub fn media_dir(&self) -> &Path {
        &self.media_dir
    }

    /// Full argv, program first.
    pub fn build_args(&self, script: &Path, scene: &str, quality: Quality) -> Vec<String> {
        let mut args = self.command.clone();
        args.push("-q".to_string());
        args.push(quality.flag().to_string());
        args.extend(self.extra_args.iter().cloned());
        args.push("--media_dir".to_string());
        args.push(self.media_dir.display().to_string());
        args.push(script.display().to_string());
        args.push(scene.to_string());
        args
    }

    /// Run the renderer on `script`, streaming its output into `log` line by line.
    pub async fn render(
        &self,
        script: &Path,
        scene: &str,
        quality: Quality,
        log: &JobLog,
    ) -> Result<RenderOutput> {
        let args = self.build_args(script, scene, quality);
        let Some((program, rest)) = args.split_first() else {
            anyhow::bail!("renderer command is empty");
        };

        log.info(format!("Running: {}", args.join(" ")));
        let started = SystemTime::now();

        let mut std_command = std::process::Command::new(program);
        std_command.args(rest);
        // Own group, so ffmpeg and other helpers can be killed with the renderer.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            std_command.process_group(0);
        }

        let mut child = Command::from(std_command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to launch renderer `{}`", program))?;
        let group = child.id();

        let stdout_buf = Arc::new(Mutex::new(String::new()));
        let stderr_buf = Arc::new(Mutex::new(String::new()));
        let out_task = tokio::spawn(pump_lines(
            child.stdout.take(),
            log.clone(),
            Arc::clone(&stdout_buf),
        ));
        let err_task = tokio::spawn(pump_lines(
            child.stderr.take(),
            log.clone(),
            Arc::clone(&stderr_buf),
        ));

        let (status, timed_out) = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(status) => (Some(status.context("Renderer wait failed")?), false),
            Err(_) => {
                log.warn(format!(
                    "Renderer exceeded {}s; killing it",
                    self.timeout.as_secs()
                ));
                kill_group(group).await;
                let _ = child.kill().await;
                (None, true)
            }
        };

        // Leftover helpers may still hold the pipes after the renderer is gone.
        let (out_done, err_done) = tokio::join!(drain(out_task), drain(err_task));
        if !(out_done && err_done) {
            log.warn("Renderer helpers kept its output open; killing them");
            kill_group(group).await;
        }

        let stdout = take_buffer(&stdout_buf);
        let mut stderr = take_buffer(&stderr_buf);
        if timed_out {
            stderr.push_str(&format!(
                "\nTimeoutError: renderer did not finish within {} seconds",
                self.timeout.as_secs()
            ));
        }

        let success = status.map(|s| s.success()).unwrap_or(false);
        let video = if success {
            let since = started.checked_sub(MTIME_SLACK).unwrap_or(started);
            newest_video(&self.scene_video_dir(script), Some(since))
        } else {
            None
        };

        Ok(RenderOutput {
            success,
            exit_code: status.and_then(|s| s.code()),
            timed_out,
            stdout,
            stderr,
            video,
        })
    }

    /// Where the renderer puts videos for one script: `<media>/videos/<stem>/`.
    fn scene_video_dir(&self, script: &Path) -> PathBuf {
        let stem = script
            .file_stem()
            .and_then(OsStr::to_str)
            .unwrap_or_default();
        self.media_dir.join("videos").join(stem)
    }
}

/// Wait a short while for an output pump; abort it if the pipe stays open.
async fn drain(task: JoinHandle<()>) -> bool {
    let abort = task.abort_handle();
    if tokio::time::timeout(DRAIN_GRACE, task).await.is_ok() {
        return true;
    }
    abort.abort();
    false
}

async fn kill_group(group: Option<u32>) {
    #[cfg(unix)]
    {
        if let Some(pid) = group {
            let _ = Command::new("kill")
                .args(["-KILL", "--", &format!("-{}", pid)])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
        }
    }
    #[cfg(not(unix))]
    {
        let _ = group;
    }
}

fn take_buffer(buf: &Mutex<String>) -> String {
    buf.lock().map(|mut s| std::mem::take(&mut *s)).unwrap_or_default()
}

async fn pump_lines<R>(reader: Option<R>, log: JobLog, collected: Arc<Mutex<String>>)
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return;
    };

    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\r', '\n']);
                if !line.trim().is_empty() {
                    log.output(line);
                }
                if let Ok(mut out) = collected.lock() {
                    out.push_str(line);
                    out.push('\n');
                }
            }
        }
    }
}

/// Most recently modified `.mp4` under `dir`, ignoring partial segments.
pub fn newest_video(dir: &Path, since: Option<SystemTime>) -> Option<PathBuf> {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry
                .path()
                .extension()
                .and_then(OsStr::to_str)
                .is_some_and(|ext| ext.eq_ignore_ascii_case("mp4"))
        })
        .filter(|entry| {
            !entry
                .path()
                .components()
                .any(|c| c.as_os_str() == OsStr::new(PARTIAL_DIR))
        })
        .filter_map(|entry| {
            let modified = entry.metadata().ok()?.modified().ok()?;
            match since {
                Some(since) if modified < since => None,
                _ => Some((modified, entry.into_path())),
            }
        })
        .max_by_key(|(modified, _)| *modified)
        .map(|(_, path)| path)
}

/// Public URL for a rendered video, relative to the served media root.
pub fn video_url(media_root: &Path, video: &Path) -> Option<String> {
    let relative = pathdiff::diff_paths(video, media_root)?;
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?.to_string()),
            _ => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(format!("/videos/{}", parts.join("/")))
}

pub async fn check_renderer(command: &[String]) -> bool {
    let Some((program, rest)) = command.split_first() else {
        return false;
    };
    match Command::new(program)
        .args(rest)
        .arg("--version")
        .stdin(Stdio::null())
        .output()
        .await
    {
        Ok(output) => output.status.success(),
        Err(_) => false,
    }
}
