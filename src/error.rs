use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("navigation to {url} failed: {message}")]
    Navigation { url: String, message: String },

    #[error("media validation failed: {0}")]
    MediaValidation(String),

    #[error("virus detected in downloaded file ({file})")]
    VirusDetected { file: String },

    #[error("virus scan failed with exit code {code:?}{details}")]
    VirusScanFailed { code: Option<i32>, details: String },

    #[error("missing required virus scanner binary: {scanner}")]
    ScannerMissing { scanner: String },

    #[error("all image downloads failed for post {post_number}")]
    AllDownloadsFailed { post_number: u64 },

    #[error("aborting after {failures} consecutive failed posts")]
    RunAborted { failures: u32 },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ScrapeError>;
