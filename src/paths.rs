use std::path::{Path, PathBuf};

pub const DOWNLOAD_DIR_ENV: &str = "SOYSCRAPER_DOWNLOAD_DIR";
pub const METADATA_DB_ENV: &str = "SOYSCRAPER_METADATA_DB";

#[derive(Debug, Clone)]
pub struct AppPaths {
    pub base_dir: PathBuf,
}

impl AppPaths {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn data_dir(&self) -> PathBuf {
        self.base_dir.join("data")
    }

    pub fn default_download_dir(&self) -> PathBuf {
        self.data_dir().join("downloadedImages")
    }

    pub fn download_dir(&self) -> PathBuf {
        match env_path(DOWNLOAD_DIR_ENV) {
            Some(dir) => dir,
            None => self.default_download_dir(),
        }
    }

    pub fn metadata_db_path(&self) -> PathBuf {
        match env_path(METADATA_DB_ENV) {
            Some(path) => path,
            None => self.data_dir().join("metadata.sqlite"),
        }
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.data_dir())?;
        std::fs::create_dir_all(self.download_dir())?;
        if let Some(parent) = self.metadata_db_path().parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    let raw = std::env::var(key).ok()?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(PathBuf::from(trimmed))
}

pub fn ensure_download_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)
}
