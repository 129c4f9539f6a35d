use crate::{Result, ScrapeError};
use std::path::PathBuf;

pub const DEFAULT_NAV_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_RETRIES: u32 = 10;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 2_000;
pub const DEFAULT_PACE_BASE_MS: u64 = 2_000;
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 10;

/// Every recognized run option with its default, resolved once at the
/// run-loop boundary. The CLI layer that fills this in lives outside the
/// crate; env overrides for the media policy and storage layout are read by
/// `safety` and `layout` respectively.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub start: Option<u64>,
    pub end: Option<u64>,
    pub out_dir: Option<PathBuf>,
    pub max_posts: Option<u64>,
    pub fill_gaps: bool,
    pub retries: u32,
    pub retry_delay_ms: u64,
    pub timeout_ms: u64,
    /// None means: 10 in sequential mode, unbounded in fill-gaps mode.
    pub max_consecutive_failures: Option<u32>,
    /// Consumed by the external browser layer; carried through unchanged.
    pub headless: bool,
    pub skip_nsfw: bool,
    pub skip_nsfl: bool,
    pub nsfw_file: Option<PathBuf>,
    pub nsfl_file: Option<PathBuf>,
    pub strict_media_safety: bool,
    pub pace_base_ms: u64,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            start: None,
            end: None,
            out_dir: None,
            max_posts: None,
            fill_gaps: false,
            retries: DEFAULT_RETRIES,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            timeout_ms: DEFAULT_NAV_TIMEOUT_MS,
            max_consecutive_failures: None,
            headless: true,
            skip_nsfw: false,
            skip_nsfl: false,
            nsfw_file: None,
            nsfl_file: None,
            strict_media_safety: true,
            pace_base_ms: DEFAULT_PACE_BASE_MS,
        }
    }
}

impl RunOptions {
    pub fn validate(&self) -> Result<()> {
        if self.start == Some(0) || self.end == Some(0) {
            return Err(ScrapeError::Config(
                "post numbers are positive; --start/--end must be >= 1".to_string(),
            ));
        }
        if self.max_posts == Some(0) {
            return Err(ScrapeError::Config(
                "--max-posts must be >= 1 when set".to_string(),
            ));
        }
        if self.timeout_ms == 0 {
            return Err(ScrapeError::Config(
                "navigation timeout must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Failure ceiling for this run; `None` means unbounded (fill-gaps only).
    pub fn failure_ceiling(&self) -> Option<u32> {
        match self.max_consecutive_failures {
            Some(limit) => Some(limit),
            None if self.fill_gaps => None,
            None => Some(DEFAULT_MAX_CONSECUTIVE_FAILURES),
        }
    }
}

pub fn parse_boolean(value: Option<&str>, fallback: bool) -> bool {
    let Some(raw) = value else {
        return fallback;
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => fallback,
    }
}

pub fn parse_positive_u64(value: Option<&str>, fallback: u64) -> u64 {
    value
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .filter(|parsed| *parsed > 0)
        .unwrap_or(fallback)
}

pub fn parse_csv(value: Option<&str>) -> Vec<String> {
    let Some(raw) = value else {
        return Vec::new();
    };
    raw.split(',')
        .map(|part| part.trim().to_ascii_lowercase())
        .filter(|part| !part.is_empty())
        .collect()
}

pub fn env_string(key: &str) -> Option<String> {
    let raw = std::env::var(key).ok()?;
    let trimmed = raw.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
