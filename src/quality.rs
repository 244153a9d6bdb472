use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

static ADD_CALL: Lazy<Regex> = Lazy::new(|| Regex::new(r"self\.add\(").unwrap());
static PLAY_CALL: Lazy<Regex> = Lazy::new(|| Regex::new(r"self\.play\(").unwrap());
static CONSTRUCTION: Lazy<Regex> = Lazy::new(|| Regex::new(r"=\s*\w+\(").unwrap());
static TRANSFORM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"ReplacementTransform|Transform").unwrap());

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Low,
    Medium,
    High,
}

impl Quality {
    /// Value for the renderer's `-q` flag.
    pub fn flag(&self) -> &'static str {
        match self {
            Quality::Low => "l",
            Quality::Medium => "m",
            Quality::High => "h",
        }
    }

    pub fn resolution(&self) -> (u32, u32) {
        match self {
            Quality::Low => (854, 480),
            Quality::Medium => (1280, 720),
            Quality::High => (1920, 1080),
        }
    }

    pub fn frame_rate(&self) -> u32 {
        match self {
            Quality::Low => 15,
            Quality::Medium => 30,
            Quality::High => 60,
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (w, h) = self.resolution();
        write!(f, "{}x{}@{}", w, h, self.frame_rate())
    }
}

/// Rough cost estimate: more objects, animations and transforms render slower.
pub fn complexity_score(code: &str) -> f64 {
    let adds = ADD_CALL.find_iter(code).count() as f64;
    let plays = PLAY_CALL.find_iter(code).count() as f64;
    let constructions = CONSTRUCTION.find_iter(code).count() as f64;
    let transforms = TRANSFORM.find_iter(code).count() as f64;

    adds * 0.5 + plays * 1.0 + constructions * 0.3 + transforms * 1.5
}

pub fn choose_quality(score: f64, explicit: Option<Quality>) -> Quality {
    if let Some(quality) = explicit {
        return quality;
    }
    if score < 5.0 {
        Quality::High
    } else if score < 15.0 {
        Quality::Medium
    } else {
        Quality::Low
    }
}
