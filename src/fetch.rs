use crate::models::now_ms;
use crate::safety::{
    detect_media_type, is_generic_mime, is_supported_mime, normalize_mime, scan_file_for_malware,
    validate_media_url, MediaSafetyPolicy, MediaType, MAX_SIGNATURE_BYTES,
};
use crate::{Result, ScrapeError};
use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;
use ureq::ResponseExt;
use url::Url;

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36";
const STREAM_CHUNK_BYTES: usize = 64 * 1024;

/// Best-effort request headers lifted from the rendered page.
#[derive(Debug, Clone, Default)]
pub struct RequestHeaders {
    pub referer: Option<String>,
    pub user_agent: Option<String>,
    pub cookie: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct DownloadInfo {
    pub bytes_written: u64,
    pub detected_type: Option<MediaType>,
}

/// Seam between the post processor and the network: fetches one media URL
/// into a quarantine path, enforcing the safety policy.
pub trait MediaFetcher {
    fn fetch(
        &self,
        url: &str,
        quarantine_path: &Path,
        headers: &RequestHeaders,
        policy: &MediaSafetyPolicy,
    ) -> Result<DownloadInfo>;
}

pub struct HttpFetcher {
    agent: ureq::Agent,
}

impl HttpFetcher {
    pub fn new(timeout_ms: u64) -> Self {
        let mut config = ureq::Agent::config_builder();
        config = config
            .http_status_as_error(false)
            .timeout_global(Some(Duration::from_millis(timeout_ms.max(1))))
            .user_agent(DEFAULT_USER_AGENT);
        let agent: ureq::Agent = config.build().into();
        Self { agent }
    }
}

impl MediaFetcher for HttpFetcher {
    fn fetch(
        &self,
        url: &str,
        quarantine_path: &Path,
        headers: &RequestHeaders,
        policy: &MediaSafetyPolicy,
    ) -> Result<DownloadInfo> {
        validate_media_url(url, policy, "media URL")?;

        let result = self.fetch_inner(url, quarantine_path, headers, policy);
        if result.is_err() {
            remove_file_if_exists(quarantine_path)?;
        }
        result
    }
}

impl HttpFetcher {
    fn fetch_inner(
        &self,
        url: &str,
        quarantine_path: &Path,
        headers: &RequestHeaders,
        policy: &MediaSafetyPolicy,
    ) -> Result<DownloadInfo> {
        // The policy timeout wins over whatever the agent was built with, so
        // SOYSCRAPER_DOWNLOAD_TIMEOUT_MS applies per download.
        let timeout = Duration::from_millis(policy.download_timeout_ms.max(1));
        let mut request = self
            .agent
            .get(url)
            .config()
            .timeout_global(Some(timeout))
            .build();
        if let Some(referer) = headers.referer.as_deref() {
            request = request.header("Referer", referer);
        }
        if let Some(user_agent) = headers.user_agent.as_deref() {
            request = request.header("User-Agent", user_agent);
        }
        if let Some(cookie) = headers.cookie.as_deref() {
            if !cookie.trim().is_empty() {
                request = request.header("Cookie", cookie.trim());
            }
        }

        let mut response = request
            .call()
            .map_err(|err| ScrapeError::MediaValidation(format!("request failed: {err}")))?;

        if policy.strict {
            // Redirects may have moved us off the vetted host.
            let final_url = response.get_uri().to_string();
            validate_media_url(&final_url, policy, "redirect target URL")?;
        }

        let status = response.status().as_u16();
        if status >= 400 {
            return Err(ScrapeError::MediaValidation(format!("HTTP {status}")));
        }

        let header_mime = normalize_mime(&header_string(&response, "content-type"));
        if policy.strict
            && !header_mime.is_empty()
            && !is_supported_mime(&header_mime)
            && !is_generic_mime(&header_mime)
        {
            return Err(ScrapeError::MediaValidation(format!(
                "blocked unsupported content-type: {header_mime}"
            )));
        }

        if policy.max_download_bytes > 0 {
            if let Ok(length) = header_string(&response, "content-length").parse::<u64>() {
                if length > policy.max_download_bytes {
                    return Err(ScrapeError::MediaValidation(format!(
                        "blocked file larger than max allowed size ({} bytes)",
                        policy.max_download_bytes
                    )));
                }
            }
        }

        if let Some(parent) = quarantine_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let (bytes_written, signature) = stream_to_file(
            response.body_mut().as_reader(),
            quarantine_path,
            policy.max_download_bytes,
        )?;

        let detected_type = verify_media_signature(policy, &header_mime, &signature)?;

        scan_file_for_malware(quarantine_path, policy, &scan_display_name(url))?;

        Ok(DownloadInfo {
            bytes_written,
            detected_type,
        })
    }
}

/// Sniffs the media type from the signature bytes. Under a strict policy an
/// unrecognized or unsupported signature is fatal, as is a header MIME that
/// contradicts the sniffed one.
fn verify_media_signature(
    policy: &MediaSafetyPolicy,
    header_mime: &str,
    signature: &[u8],
) -> Result<Option<MediaType>> {
    let detected_type = detect_media_type(signature);
    if policy.strict {
        let Some(detected) = detected_type else {
            return Err(ScrapeError::MediaValidation(
                "unable to verify media type from file signature".to_string(),
            ));
        };
        if !is_supported_mime(detected.mime) {
            return Err(ScrapeError::MediaValidation(format!(
                "blocked unsupported media signature ({})",
                detected.mime
            )));
        }
        if !header_mime.is_empty() && !is_generic_mime(header_mime) && header_mime != detected.mime
        {
            return Err(ScrapeError::MediaValidation(format!(
                "content-type mismatch (header={header_mime}, detected={})",
                detected.mime
            )));
        }
    }
    Ok(detected_type)
}

/// Streams the body to disk, buffering the first 64 bytes for signature
/// sniffing and aborting the instant cumulative bytes exceed the ceiling.
fn stream_to_file(
    mut reader: impl Read,
    path: &Path,
    max_bytes: u64,
) -> Result<(u64, Vec<u8>)> {
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    let mut bytes_written: u64 = 0;
    let mut signature: Vec<u8> = Vec::with_capacity(MAX_SIGNATURE_BYTES);
    let mut buf = vec![0_u8; STREAM_CHUNK_BYTES];

    loop {
        let read = reader
            .read(&mut buf)
            .map_err(|err| ScrapeError::MediaValidation(format!("read failed: {err}")))?;
        if read == 0 {
            break;
        }
        bytes_written += read as u64;
        if max_bytes > 0 && bytes_written > max_bytes {
            return Err(ScrapeError::MediaValidation(format!(
                "download exceeds max allowed size ({max_bytes} bytes)"
            )));
        }
        if signature.len() < MAX_SIGNATURE_BYTES {
            let needed = MAX_SIGNATURE_BYTES - signature.len();
            signature.extend_from_slice(&buf[..read.min(needed)]);
        }
        file.write_all(&buf[..read])?;
    }

    file.flush()?;
    Ok((bytes_written, signature))
}

pub fn remove_file_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// `<base>.<timestamp_ms>.<random>.part`, unique per attempt.
pub fn quarantine_part_name(base: &str) -> String {
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!("{base}.{}.{}.part", now_ms(), &random[..8])
}

fn header_string(response: &ureq::http::Response<ureq::Body>, key: &str) -> String {
    response
        .headers()
        .get(key)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}

fn scan_display_name(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "download".to_string())
}
