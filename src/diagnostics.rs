use crate::tail_utf8_safe;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Renderer output kept for prompting; tracebacks put the useful part last.
pub const MAX_ERROR_CHARS: usize = 4_000;

static ERROR_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)(\w+(?:Error|Exception)):\s*(.+?)\s*$").unwrap());
static FILE_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"File "(.+?)", line (\d+)"#).unwrap());
static NUMBERED_SOURCE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s+\d+\s+").unwrap());
static RICH_SOURCE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[│|\s]*(?:❱|>)?\s*\d+\s*[│|]").unwrap());

/// What went wrong in one renderer run, as far as its output tells.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderDiagnostic {
    pub raw: String,
    pub error_type: Option<String>,
    pub message: String,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub context: Option<String>,
}

impl RenderDiagnostic {
    /// One-line summary such as `NameError: name 'x' is not defined`.
    pub fn headline(&self) -> String {
        match self.error_type.as_deref() {
            Some(kind) => format!("{}: {}", kind, self.message),
            None => self.message.clone(),
        }
    }
}

pub fn parse_render_error(output: &str) -> RenderDiagnostic {
    let raw = tail_utf8_safe(output, MAX_ERROR_CHARS).to_string();

    let (error_type, message) = match ERROR_LINE.captures_iter(output).last() {
        Some(cap) => (Some(cap[1].to_string()), cap[2].to_string()),
        None => (
            None,
            output
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .last()
                .unwrap_or("Unknown error")
                .to_string(),
        ),
    };

    let (file, line) = match FILE_LINE.captures_iter(output).last() {
        Some(cap) => (Some(cap[1].to_string()), cap[2].parse::<u32>().ok()),
        None => (None, None),
    };

    RenderDiagnostic {
        raw,
        error_type,
        message,
        file,
        line,
        context: source_context(output),
    }
}

/// The last run of numbered source lines quoted by the traceback.
fn source_context(output: &str) -> Option<String> {
    let mut blocks: Vec<Vec<&str>> = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for line in output.lines() {
        let numbered = NUMBERED_SOURCE.is_match(line) || RICH_SOURCE.is_match(line);
        if numbered {
            current.push(line.trim_end());
        } else if !current.is_empty() {
            blocks.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        blocks.push(current);
    }

    blocks.pop().map(|lines| lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAIN_TRACEBACK: &str = r#"Traceback (most recent call last):
  File "/usr/lib/python3/site-packages/manim/cli/render/commands.py", line 120, in render
    scene.render()
  File "/work/generated_scenes/scene_x1.py", line 6, in construct
    circle = Circel(radius=1)
NameError: name 'Circel' is not defined"#;

    const RICH_TRACEBACK: &str = "╭──── Traceback (most recent call last) ────╮
│ /work/generated_scenes/scene_x2.py:7 in construct │
│                                                   │
│    6 │   │   square = Square()                    │
│ ❱  7 │   │   self.play(square.animate.spin())     │
│    8 │   │   self.wait()                          │
╰───────────────────────────────────────────────────╯
AttributeError: Square object has no attribute 'spin'";

    #[test]
    fn plain_traceback_yields_type_message_and_location() {
        let diag = parse_render_error(PLAIN_TRACEBACK);
        assert_eq!(diag.error_type.as_deref(), Some("NameError"));
        assert_eq!(diag.message, "name 'Circel' is not defined");
        assert_eq!(diag.file.as_deref(), Some("/work/generated_scenes/scene_x1.py"));
        assert_eq!(diag.line, Some(6));
    }

    #[test]
    fn rich_traceback_context_is_captured() {
        let diag = parse_render_error(RICH_TRACEBACK);
        assert_eq!(diag.error_type.as_deref(), Some("AttributeError"));
        let context = diag.context.unwrap();
        assert!(context.contains("❱  7"));
        assert!(context.contains("self.wait()"));
        assert!(!context.contains("Traceback"));
    }

    #[test]
    fn untyped_output_falls_back_to_last_line() {
        let diag = parse_render_error("rendering...\nKilled\n\n");
        assert!(diag.error_type.is_none());
        assert_eq!(diag.message, "Killed");

        assert_eq!(parse_render_error("").message, "Unknown error");
    }

    #[test]
    fn raw_output_is_capped_from_the_end() {
        let long = format!("{}\nValueError: bad", "x".repeat(MAX_ERROR_CHARS * 2));
        let diag = parse_render_error(&long);
        assert_eq!(diag.raw.len(), MAX_ERROR_CHARS);
        assert!(diag.raw.ends_with("ValueError: bad"));
        assert_eq!(diag.error_type.as_deref(), Some("ValueError"));
    }
}
