//! Pulling a runnable scene script out of free-form model output.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const DEFAULT_SCENE: &str = "MainScene";
const MANIM_IMPORT_LINE: &str = "from manim import *";

static TAG_BLOCK: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<manim>(.*?)</manim>").unwrap());
static FENCE_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?ms)^[ \t]*```[ \t]*([\w+-]*)[^\n]*\n(.*?)^[ \t]*```").unwrap()
});
static SCENE_CLASS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^[ \t]*class\s+(\w+)\s*\(\s*[\w.]*Scene\s*\)\s*:").unwrap()
});
static MANIM_IMPORT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^[ \t]*(?:from\s+manim\b|import\s+manim\b)").unwrap());
static LEADING_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*```[A-Za-z0-9_+-]*[ \t]*\r?\n?").unwrap());
static TRAILING_FENCE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*```\s*$").unwrap());
static FENCE_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*```[A-Za-z0-9_+-]*\s*$").unwrap());

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SceneScript {
    pub code: String,
    pub scene_name: String,
}

/// Drop a leading ```` ```python ```` marker and a trailing ```` ``` ````.
pub fn strip_code_fences(text: &str) -> String {
    let text = LEADING_FENCE.replace(text, "");
    let text = TRAILING_FENCE.replace(&text, "");
    text.into_owned()
}

/// Names of every class deriving from a `*Scene` base, in source order.
pub fn scene_classes(code: &str) -> Vec<String> {
    SCENE_CLASS
        .captures_iter(code)
        .map(|cap| cap[1].to_string())
        .collect()
}

pub fn extract_scene_script(text: &str) -> Option<SceneScript> {
    let body = if let Some(tagged) = join_blocks(&TAG_BLOCK, text) {
        tagged
    } else if let Some(fenced) = python_blocks(text).filter(|b| SCENE_CLASS.is_match(b)) {
        fenced
    } else {
        let stripped = strip_code_fences(text);
        if SCENE_CLASS.is_match(&stripped) && starts_like_code(&stripped) {
            stripped
        } else {
            filter_code_lines(&stripped)
        }
    };

    let code = cleanup(&body);
    let classes = scene_classes(&code);
    let scene_name = if classes.iter().any(|c| c == DEFAULT_SCENE) {
        DEFAULT_SCENE.to_string()
    } else {
        classes.into_iter().next()?
    };

    Some(SceneScript { code, scene_name })
}

fn join_blocks(re: &Regex, text: &str) -> Option<String> {
    join_nonempty(re.captures_iter(text).filter_map(|cap| cap.get(1)))
}

/// Fenced blocks tagged as Python or untagged; `bash`, `text` and friends are skipped.
fn python_blocks(text: &str) -> Option<String> {
    join_nonempty(
        FENCE_BLOCK
            .captures_iter(text)
            .filter(|cap| is_python_tag(&cap[1]))
            .filter_map(|cap| cap.get(2)),
    )
}

fn is_python_tag(tag: &str) -> bool {
    matches!(
        tag.to_ascii_lowercase().as_str(),
        "" | "py" | "python" | "python3"
    )
}

fn join_nonempty<'h>(blocks: impl Iterator<Item = regex::Match<'h>>) -> Option<String> {
    let blocks: Vec<&str> = blocks
        .map(|m| m.as_str().trim_matches('\n').trim_end())
        .filter(|b| !b.trim().is_empty())
        .collect();

    if blocks.is_empty() {
        None
    } else {
        Some(blocks.join("\n\n"))
    }
}

fn starts_like_code(text: &str) -> bool {
    text.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .is_some_and(|first| {
            first.starts_with("from ")
                || first.starts_with("import ")
                || first.starts_with("class ")
                || first.starts_with('#')
        })
}

/// Keep the lines that look like Python, starting at the first import or class.
fn filter_code_lines(text: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    let mut started = false;
    let mut in_code = false;
    let mut open_blocks = 0usize;

    for line in text.lines() {
        let stripped = line.trim();

        if !started {
            if stripped.starts_with("from ")
                || stripped.starts_with("import ")
                || stripped.starts_with("class ")
            {
                started = true;
            } else {
                continue;
            }
        }

        let looks_like_code = stripped.starts_with("import ")
            || stripped.starts_with("from ")
            || stripped.starts_with("class ")
            || stripped.starts_with("def ")
            || stripped.starts_with("if ")
            || stripped.ends_with(':')
            || stripped.contains('=');

        if looks_like_code {
            in_code = true;
            out.push(line);
            if stripped.ends_with(':') {
                open_blocks += 1;
            }
        } else if in_code
            && (stripped.starts_with('#')
                || (open_blocks > 0 && (line.starts_with(' ') || line.starts_with('\t'))))
        {
            out.push(line);
        } else if stripped.is_empty() && in_code {
            out.push(line);
        } else {
            in_code = false;
        }
    }

    out.join("\n")
}

fn cleanup(code: &str) -> String {
    let kept: Vec<&str> = code
        .lines()
        .filter(|line| !FENCE_LINE.is_match(line))
        .collect();
    let code = kept.join("\n");
    let code = code.trim_matches('\n').trim_end();

    if MANIM_IMPORT.is_match(code) {
        format!("{}\n", code)
    } else {
        format!("{}\n{}\n", MANIM_IMPORT_LINE, code)
    }
}
