use std::sync::Arc;

pub mod api;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod extract;
pub mod history;
pub mod init;
pub mod jobs;
pub mod pipeline;
pub mod prompts;
pub mod quality;
pub mod renderer;
pub mod server;

pub type LogHook = Arc<dyn Fn(&str) + Send + Sync + 'static>;

/// Tagged progress log for one generation run.
///
/// Every line goes to `tracing`; when a hook is attached the formatted
/// `[TAG] message` line is also handed to it, which is how render output
/// reaches the job board and the browser.
#[derive(Clone, Default)]
pub struct JobLog {
    hook: Option<LogHook>,
}

impl JobLog {
    pub fn new(hook: LogHook) -> Self {
        Self { hook: Some(hook) }
    }

    pub fn silent() -> Self {
        Self::default()
    }

    fn emit(&self, tag: &str, message: &str) {
        match tag {
            "WARN" => tracing::warn!("{}", message),
            "OUT" => tracing::debug!("{}", message),
            _ => tracing::info!("{}", message),
        }

        if let Some(hook) = self.hook.as_ref() {
            let line = format!("[{}] {}", tag, message);
            hook(&line);
        }
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.emit("INFO", message.as_ref());
    }

    pub fn ok(&self, message: impl AsRef<str>) {
        self.emit("OK", message.as_ref());
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        self.emit("WARN", message.as_ref());
    }

    /// Raw renderer output line.
    pub fn output(&self, message: impl AsRef<str>) {
        self.emit("OUT", message.as_ref());
    }
}

impl std::fmt::Debug for JobLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobLog")
            .field("hooked", &self.hook.is_some())
            .finish()
    }
}

/// Cut `input` to at most `max_bytes`, keeping the end, without splitting a char.
pub(crate) fn tail_utf8_safe(input: &str, max_bytes: usize) -> &str {
    if input.len() <= max_bytes {
        return input;
    }

    let mut cut = input.len() - max_bytes;
    while cut < input.len() && !input.is_char_boundary(cut) {
        cut += 1;
    }
    &input[cut..]
}

/// Cut `input` to at most `max_bytes`, keeping the start, without splitting a char.
pub(crate) fn trim_copy_utf8_safe(input: &str, max_bytes: usize) -> String {
    if input.len() <= max_bytes {
        return input.to_string();
    }

    let mut cut = max_bytes.min(input.len());
    while cut > 0 && !input.is_char_boundary(cut) {
        cut -= 1;
    }
    input[..cut].to_string()
}
