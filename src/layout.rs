use crate::options::{env_string, parse_positive_u64};
use std::path::{Path, PathBuf};

pub const IMAGE_LAYOUT_ENV: &str = "SOYSCRAPER_IMAGE_LAYOUT";
pub const BUCKET_SIZE_ENV: &str = "SOYSCRAPER_IMAGE_BUCKET_SIZE";
pub const DEFAULT_BUCKET_SIZE: u64 = 1000;
const MIN_PAD_WIDTH: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageLayout {
    Flat,
    Bucket,
}

/// Deterministic mapping from post number to output directory. Bucketing
/// keeps per-directory fan-out bounded while staying reconstructable from the
/// post number alone.
#[derive(Debug, Clone, Copy)]
pub struct StorageLayout {
    pub layout: ImageLayout,
    pub bucket_size: u64,
}

impl Default for StorageLayout {
    fn default() -> Self {
        Self {
            layout: ImageLayout::Bucket,
            bucket_size: DEFAULT_BUCKET_SIZE,
        }
    }
}

impl StorageLayout {
    pub fn from_env() -> Self {
        let layout = match env_string(IMAGE_LAYOUT_ENV).as_deref() {
            Some(raw) if raw.eq_ignore_ascii_case("flat") => ImageLayout::Flat,
            _ => ImageLayout::Bucket,
        };
        let bucket_size = parse_positive_u64(
            env_string(BUCKET_SIZE_ENV).as_deref(),
            DEFAULT_BUCKET_SIZE,
        );
        Self {
            layout,
            bucket_size,
        }
    }

    pub fn bucket_label(&self, post_number: u64) -> String {
        let start = (post_number / self.bucket_size) * self.bucket_size;
        let end = start + self.bucket_size - 1;
        let pad = end.to_string().len().max(MIN_PAD_WIDTH);
        format!("{start:0pad$}-{end:0pad$}")
    }

    pub fn resolve_post_dir(&self, root: &Path, post_number: u64) -> PathBuf {
        match self.layout {
            ImageLayout::Flat => root.to_path_buf(),
            ImageLayout::Bucket => root.join(self.bucket_label(post_number)),
        }
    }
}
