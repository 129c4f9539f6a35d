use crate::options::{env_string, parse_boolean, parse_csv, parse_positive_u64};
use crate::{Result, ScrapeError};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::process::Command;
use url::Url;

pub const MAX_DOWNLOAD_BYTES_ENV: &str = "SOYSCRAPER_MAX_DOWNLOAD_BYTES";
pub const DOWNLOAD_TIMEOUT_ENV: &str = "SOYSCRAPER_DOWNLOAD_TIMEOUT_MS";
pub const ALLOWED_HOSTS_ENV: &str = "SOYSCRAPER_ALLOWED_MEDIA_HOSTS";
pub const REQUIRE_VIRUS_SCAN_ENV: &str = "SOYSCRAPER_REQUIRE_VIRUS_SCAN";
pub const VIRUS_SCANNER_BIN_ENV: &str = "SOYSCRAPER_VIRUS_SCANNER_BIN";

pub const DEFAULT_MAX_DOWNLOAD_BYTES: u64 = 100 * 1024 * 1024;
pub const DEFAULT_DOWNLOAD_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_VIRUS_SCANNER_BIN: &str = "clamscan";
pub const MAX_SIGNATURE_BYTES: usize = 64;

const DEFAULT_ALLOWED_MEDIA_HOSTS: &[&str] = &["soybooru.com", ".soybooru.com"];

const SUPPORTED_MIMES: &[&str] = &[
    "image/jpeg",
    "image/png",
    "image/gif",
    "image/webp",
    "image/avif",
    "video/mp4",
    "video/webm",
];

/// Per-run media safety settings, composed from flags and `SOYSCRAPER_*`
/// environment overrides plus the referring post's own host.
#[derive(Debug, Clone)]
pub struct MediaSafetyPolicy {
    pub strict: bool,
    pub max_download_bytes: u64,
    pub download_timeout_ms: u64,
    pub allowed_hosts: Vec<String>,
    pub require_virus_scan: bool,
    pub virus_scanner_bin: String,
}

impl MediaSafetyPolicy {
    pub fn from_env(strict: bool, nav_timeout_ms: u64, referer_url: &str) -> Self {
        let max_download_bytes = parse_positive_u64(
            env_string(MAX_DOWNLOAD_BYTES_ENV).as_deref(),
            DEFAULT_MAX_DOWNLOAD_BYTES,
        );
        let fallback_timeout = if nav_timeout_ms > 0 {
            nav_timeout_ms
        } else {
            DEFAULT_DOWNLOAD_TIMEOUT_MS
        };
        let download_timeout_ms = parse_positive_u64(
            env_string(DOWNLOAD_TIMEOUT_ENV).as_deref(),
            fallback_timeout,
        );
        // Strict runs scan by default; non-strict runs only when asked.
        let require_virus_scan =
            parse_boolean(env_string(REQUIRE_VIRUS_SCAN_ENV).as_deref(), strict);
        let virus_scanner_bin = env_string(VIRUS_SCANNER_BIN_ENV)
            .unwrap_or_else(|| DEFAULT_VIRUS_SCANNER_BIN.to_string());

        Self {
            strict,
            max_download_bytes,
            download_timeout_ms,
            allowed_hosts: build_allowed_hosts(referer_url),
            require_virus_scan,
            virus_scanner_bin,
        }
    }

    pub fn host_allowed(&self, hostname: &str) -> bool {
        self.allowed_hosts
            .iter()
            .any(|pattern| host_matches_pattern(hostname, pattern))
    }
}

/// Base site domains, operator-configured extras, and the referring page's
/// own host (so same-origin CDN redirects stay reachable).
pub fn build_allowed_hosts(referer_url: &str) -> Vec<String> {
    let mut patterns: Vec<String> = Vec::new();
    let mut push = |raw: &str| {
        let normalized = normalize_host_pattern(raw);
        if !normalized.is_empty() && !patterns.contains(&normalized) {
            patterns.push(normalized);
        }
    };
    for host in DEFAULT_ALLOWED_MEDIA_HOSTS {
        push(host);
    }
    for host in parse_csv(env_string(ALLOWED_HOSTS_ENV).as_deref()) {
        push(&host);
    }
    if let Ok(parsed) = Url::parse(referer_url) {
        if let Some(host) = parsed.host_str() {
            push(host);
        }
    }
    patterns
}

fn normalize_host_pattern(value: &str) -> String {
    value
        .trim()
        .to_ascii_lowercase()
        .trim_end_matches('.')
        .to_string()
}

/// A leading dot means "this domain or any subdomain of it".
pub fn host_matches_pattern(hostname: &str, pattern: &str) -> bool {
    let host = normalize_host_pattern(hostname);
    let pattern = normalize_host_pattern(pattern);
    if host.is_empty() || pattern.is_empty() {
        return false;
    }
    if let Some(suffix) = pattern.strip_prefix('.') {
        return host == suffix || host.ends_with(&format!(".{suffix}"));
    }
    host == pattern
}

fn is_private_ipv4(ip: Ipv4Addr) -> bool {
    let [a, b, _, _] = ip.octets();
    a == 0
        || a == 10
        || (a == 100 && (64..=127).contains(&b))
        || a == 127
        || (a == 169 && b == 254)
        || (a == 172 && (16..=31).contains(&b))
        || (a == 192 && b == 168)
        || (a == 198 && (b == 18 || b == 19))
        || a >= 224
}

fn is_private_ipv6(ip: Ipv6Addr) -> bool {
    if ip.is_unspecified() || ip.is_loopback() {
        return true;
    }
    let segments = ip.segments();
    // fe80::/10 link-local, fc00::/7 unique-local.
    if segments[0] & 0xffc0 == 0xfe80 || segments[0] & 0xfe00 == 0xfc00 {
        return true;
    }
    if let Some(mapped) = ip.to_ipv4_mapped() {
        return is_private_ipv4(mapped);
    }
    false
}

/// Loopback/link-local/private hosts are never valid media sources.
pub fn is_unsafe_hostname(hostname: &str) -> bool {
    let normalized = normalize_host_pattern(hostname);
    if normalized.is_empty() {
        return true;
    }
    if normalized == "localhost" || normalized == "localhost.localdomain" {
        return true;
    }
    if normalized.ends_with(".local") {
        return true;
    }
    let bare = normalized
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .unwrap_or(&normalized);
    if let Ok(v4) = bare.parse::<Ipv4Addr>() {
        return is_private_ipv4(v4);
    }
    if let Ok(v6) = bare.parse::<Ipv6Addr>() {
        return is_private_ipv6(v6);
    }
    false
}

/// Parses and, in strict mode, vets a candidate media URL against the scheme,
/// unsafe-host, and allow-list rules. `label` distinguishes original URLs
/// from redirect targets in error messages.
pub fn validate_media_url(
    raw_url: &str,
    policy: &MediaSafetyPolicy,
    label: &str,
) -> Result<Url> {
    let parsed = Url::parse(raw_url)
        .map_err(|_| ScrapeError::MediaValidation(format!("invalid {label}: {raw_url}")))?;

    if !policy.strict {
        return Ok(parsed);
    }

    if parsed.scheme() != "https" {
        return Err(ScrapeError::MediaValidation(format!(
            "blocked non-HTTPS {label}: {parsed}"
        )));
    }
    let hostname = parsed.host_str().unwrap_or("");
    if is_unsafe_hostname(hostname) {
        return Err(ScrapeError::MediaValidation(format!(
            "blocked unsafe host in {label}: {hostname}"
        )));
    }
    if !policy.host_allowed(hostname) {
        return Err(ScrapeError::MediaValidation(format!(
            "blocked untrusted media host: {hostname}"
        )));
    }
    Ok(parsed)
}

/// Drops charset/parameters and lowercases: `image/JPEG; q=1` -> `image/jpeg`.
pub fn normalize_mime(value: &str) -> String {
    value
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

pub fn is_generic_mime(mime: &str) -> bool {
    mime == "application/octet-stream" || mime == "binary/octet-stream"
}

pub fn is_supported_mime(mime: &str) -> bool {
    SUPPORTED_MIMES.contains(&mime)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaType {
    pub mime: &'static str,
    pub ext: &'static str,
}

/// Magic-number sniffing over the first bytes of the payload. Covers JPEG,
/// PNG, GIF87a/89a, RIFF/WEBP, ISO-BMFF ftyp boxes (avif/avis vs generic
/// mp4), and WebM's EBML header.
pub fn detect_media_type(signature: &[u8]) -> Option<MediaType> {
    if signature.len() >= 3 && signature[0] == 0xff && signature[1] == 0xd8 && signature[2] == 0xff
    {
        return Some(MediaType {
            mime: "image/jpeg",
            ext: ".jpg",
        });
    }
    if signature.len() >= 8
        && signature[..8] == [0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a]
    {
        return Some(MediaType {
            mime: "image/png",
            ext: ".png",
        });
    }
    if signature.len() >= 6 && (&signature[..6] == b"GIF87a" || &signature[..6] == b"GIF89a") {
        return Some(MediaType {
            mime: "image/gif",
            ext: ".gif",
        });
    }
    if signature.len() >= 12 && &signature[..4] == b"RIFF" && &signature[8..12] == b"WEBP" {
        return Some(MediaType {
            mime: "image/webp",
            ext: ".webp",
        });
    }
    if signature.len() >= 12 && &signature[4..8] == b"ftyp" {
        let brand = &signature[8..12];
        if brand == b"avif" || brand == b"avis" {
            return Some(MediaType {
                mime: "image/avif",
                ext: ".avif",
            });
        }
        return Some(MediaType {
            mime: "video/mp4",
            ext: ".mp4",
        });
    }
    if signature.len() >= 4 && signature[..4] == [0x1a, 0x45, 0xdf, 0xa3] {
        return Some(MediaType {
            mime: "video/webm",
            ext: ".webm",
        });
    }
    None
}

fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        match std::fs::metadata(path) {
            Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
            Err(_) => false,
        }
    }
    #[cfg(not(unix))]
    {
        path.is_file()
    }
}

pub fn command_exists(command_name: &str) -> bool {
    if command_name.is_empty() {
        return false;
    }
    let as_path = Path::new(command_name);
    if as_path.components().count() > 1 {
        return is_executable(as_path);
    }
    let Some(env_path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&env_path).any(|dir| is_executable(&dir.join(command_name)))
}

/// Preflight: a strict run that requires scanning must find the scanner
/// before any network activity starts.
pub fn ensure_virus_scanner_available(policy: &MediaSafetyPolicy) -> Result<()> {
    if !policy.strict || !policy.require_virus_scan {
        return Ok(());
    }
    if command_exists(&policy.virus_scanner_bin) {
        return Ok(());
    }
    Err(ScrapeError::ScannerMissing {
        scanner: policy.virus_scanner_bin.clone(),
    })
}

/// Runs the external scanner over a quarantined file. Exit code 0 is clean,
/// 1 is infected, anything else is a scanner failure.
pub fn scan_file_for_malware(
    file_path: &Path,
    policy: &MediaSafetyPolicy,
    display_name: &str,
) -> Result<()> {
    if !policy.require_virus_scan {
        return Ok(());
    }

    let output = Command::new(&policy.virus_scanner_bin)
        .args(["--no-summary", "--infected", "--stdout"])
        .arg(file_path)
        .output()
        .map_err(|err| ScrapeError::VirusScanFailed {
            code: None,
            details: format!(
                ": scanner {} failed to start: {err}",
                policy.virus_scanner_bin
            ),
        })?;

    match output.status.code() {
        Some(0) => Ok(()),
        Some(1) => Err(ScrapeError::VirusDetected {
            file: display_name.to_string(),
        }),
        code => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let combined = if stderr.trim().is_empty() {
                stdout.trim().to_string()
            } else {
                stderr.trim().to_string()
            };
            let details = if combined.is_empty() {
                String::new()
            } else {
                format!(": {combined}")
            };
            Err(ScrapeError::VirusScanFailed { code, details })
        }
    }
}
