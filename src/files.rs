use crate::Result;
use std::collections::BTreeSet;
use std::path::Path;

/// Staging directory for in-flight downloads; never counted as downloaded.
pub const QUARANTINE_DIR_NAME: &str = ".quarantine";

/// Leading digits of a media filename are its post number.
pub fn parse_post_number(file_name: &str) -> Option<u64> {
    let digits: String = file_name.chars().take_while(|ch| ch.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse::<u64>().ok().filter(|n| *n > 0)
}

/// Scans the download root and its immediate subdirectories (bucket dirs) for
/// media files and returns the set of post numbers they belong to. Quarantine
/// directories are skipped so half-validated files never count as downloaded.
pub fn downloaded_post_numbers(dir: &Path) -> Result<BTreeSet<u64>> {
    let mut posts = BTreeSet::new();
    if !dir.is_dir() {
        return Ok(posts);
    }

    let mut dirs_to_scan = vec![dir.to_path_buf()];
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if entry.file_name().to_string_lossy() == QUARANTINE_DIR_NAME {
            continue;
        }
        dirs_to_scan.push(entry.path());
    }

    for sub in dirs_to_scan {
        for entry in std::fs::read_dir(&sub)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(post_number) = parse_post_number(&entry.file_name().to_string_lossy()) {
                posts.insert(post_number);
            }
        }
    }

    Ok(posts)
}

pub fn last_downloaded_post(dir: &Path) -> Result<Option<u64>> {
    let posts = downloaded_post_numbers(dir)?;
    Ok(posts.into_iter().next_back())
}
