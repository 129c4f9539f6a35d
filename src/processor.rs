use crate::extract::{extract_image_urls, extract_tag_data};
use crate::fetch::{quarantine_part_name, MediaFetcher, RequestHeaders};
use crate::files::QUARANTINE_DIR_NAME;
use crate::layout::StorageLayout;
use crate::models::PostRecord;
use crate::page::PostPage;
use crate::safety::MediaSafetyPolicy;
use crate::store::MetadataStore;
use crate::tags::TagFilters;
use crate::{LogSink, Result, ScrapeError};
use scraper::Html;
use serde_json::json;
use std::path::{Path, PathBuf};
use url::Url;

/// Per-run settings the post processor needs, resolved once by the run loop.
#[derive(Debug, Clone)]
pub struct ProcessSettings {
    pub download_dir: PathBuf,
    pub layout: StorageLayout,
    pub timeout_ms: u64,
    pub strict_media_safety: bool,
}

/// What happened to one post. Every variant is a normal, non-fatal outcome;
/// hard failures surface as errors instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostOutcome {
    /// At least one media file is on disk (newly downloaded or already there)
    /// and the metadata record was written.
    Saved {
        post_number: u64,
        downloaded: u32,
        already_present: u32,
        failed: u32,
        files: Vec<String>,
    },
    /// A tag filter matched; nothing was downloaded or persisted.
    Filtered {
        post_number: u64,
        category: &'static str,
        tag: String,
    },
    /// The page rendered but exposed no media element (deleted post, markup
    /// drift).
    NoImages { post_number: u64 },
}

/// The post number is the trailing path segment of the post URL.
pub fn post_number_from_url(post_url: &str) -> Result<u64> {
    Url::parse(post_url)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .and_then(|segment| segment.parse::<u64>().ok())
        .filter(|n| *n > 0)
        .ok_or_else(|| {
            ScrapeError::Config(format!("cannot derive post number from URL: {post_url}"))
        })
}

/// `101_soyjak`, `101_soyjak_1`, ... for a post's first and subsequent media
/// URLs. The extension is appended after download, from the sniffed type.
fn media_base_name(post_number: u64, index: usize) -> String {
    if index == 0 {
        format!("{post_number}_soyjak")
    } else {
        format!("{post_number}_soyjak_{index}")
    }
}

/// Any file named `<base>.<ext>` already in the post directory.
fn existing_file_with_base(dir: &Path, base: &str) -> Option<String> {
    let prefix = format!("{base}.");
    let entries = std::fs::read_dir(dir).ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with(&prefix) && entry.path().is_file() {
            return Some(name);
        }
    }
    None
}

fn extension_from_url(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .and_then(|segment| {
            segment
                .rsplit_once('.')
                .map(|(_, ext)| format!(".{}", ext.to_ascii_lowercase()))
        })
        .unwrap_or_else(|| ".jpg".to_string())
}

fn cookie_header(cookies: &[(String, String)]) -> Option<String> {
    if cookies.is_empty() {
        return None;
    }
    Some(
        cookies
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; "),
    )
}

/// Visits one post: navigate, extract tags and media URLs, apply tag filters,
/// download each URL through quarantine, then persist the metadata record.
///
/// Per-URL failures are isolated; the post only fails hard when navigation
/// fails or every media URL fails.
pub fn process_post(
    page: &mut dyn PostPage,
    fetcher: &dyn MediaFetcher,
    store: &mut MetadataStore,
    post_url: &str,
    settings: &ProcessSettings,
    filters: &TagFilters,
    log: LogSink<'_>,
) -> Result<PostOutcome> {
    let post_number = post_number_from_url(post_url)?;
    let post_dir = settings
        .layout
        .resolve_post_dir(&settings.download_dir, post_number);

    page.goto(post_url, settings.timeout_ms)
        .map_err(|err| ScrapeError::Navigation {
            url: post_url.to_string(),
            message: err.to_string(),
        })?;
    let html = page.content()?;
    let document = Html::parse_document(&html);

    let tag_data = extract_tag_data(&document);
    if tag_data.is_none() {
        log(
            "warn",
            "tag_data_missing",
            json!({ "post": post_number, "url": post_url }),
        );
    }

    if filters.is_active() {
        if let Some(data) = tag_data.as_ref() {
            // Only the tags field gates a post; variant/flag text does not.
            if let Some(hit) = filters.find_blocked(&data.tags) {
                log(
                    "info",
                    "post_filtered",
                    json!({ "post": post_number, "category": hit.category, "tag": hit.tag }),
                );
                return Ok(PostOutcome::Filtered {
                    post_number,
                    category: hit.category,
                    tag: hit.tag,
                });
            }
        }
    }

    let image_urls = extract_image_urls(&document, post_url);
    if image_urls.is_empty() {
        log(
            "info",
            "post_without_media",
            json!({ "post": post_number, "url": post_url }),
        );
        return Ok(PostOutcome::NoImages { post_number });
    }

    let headers = RequestHeaders {
        referer: Some(post_url.to_string()),
        user_agent: page.user_agent().ok(),
        cookie: cookie_header(&page.cookies().unwrap_or_default()),
    };
    let policy = MediaSafetyPolicy::from_env(
        settings.strict_media_safety,
        settings.timeout_ms,
        post_url,
    );

    let mut downloaded: u32 = 0;
    let mut already_present: u32 = 0;
    let mut failed: u32 = 0;
    let mut files: Vec<String> = Vec::new();

    for (index, url) in image_urls.iter().enumerate() {
        let base = media_base_name(post_number, index);

        let existing = if settings.strict_media_safety {
            existing_file_with_base(&post_dir, &base)
        } else {
            let candidate = format!("{base}{}", extension_from_url(url));
            post_dir.join(&candidate).is_file().then_some(candidate)
        };
        if let Some(name) = existing {
            log(
                "info",
                "media_already_present",
                json!({ "post": post_number, "file": name }),
            );
            already_present += 1;
            files.push(name);
            continue;
        }

        let quarantine_path = post_dir
            .join(QUARANTINE_DIR_NAME)
            .join(quarantine_part_name(&base));
        match fetcher.fetch(url, &quarantine_path, &headers, &policy) {
            Ok(info) => {
                let ext = info
                    .detected_type
                    .map(|detected| detected.ext.to_string())
                    .unwrap_or_else(|| extension_from_url(url));
                let file_name = format!("{base}{ext}");
                let final_path = post_dir.join(&file_name);
                // The pre-download check guesses the extension from the URL;
                // the sniffed one can differ, so re-check before renaming
                // rather than clobber a file from an earlier run.
                if final_path.is_file() {
                    crate::fetch::remove_file_if_exists(&quarantine_path)?;
                    log(
                        "info",
                        "media_already_present",
                        json!({ "post": post_number, "file": file_name }),
                    );
                    already_present += 1;
                    files.push(file_name);
                    continue;
                }
                std::fs::create_dir_all(&post_dir)?;
                std::fs::rename(&quarantine_path, &final_path)?;
                log(
                    "info",
                    "media_saved",
                    json!({ "post": post_number, "file": file_name, "bytes": info.bytes_written }),
                );
                downloaded += 1;
                files.push(file_name);
            }
            Err(err) => {
                failed += 1;
                log(
                    "warn",
                    "media_download_failed",
                    json!({ "post": post_number, "url": url, "error": err.to_string() }),
                );
            }
        }
    }

    if downloaded + already_present == 0 {
        return Err(ScrapeError::AllDownloadsFailed { post_number });
    }

    let record = PostRecord::new(
        post_number,
        tag_data.unwrap_or_default(),
        post_url,
        image_urls,
        files.clone(),
    );
    store.upsert(&record)?;

    Ok(PostOutcome::Saved {
        post_number,
        downloaded,
        already_present,
        failed,
        files,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::DownloadInfo;
    use crate::layout::{ImageLayout, StorageLayout};
    use crate::safety::detect_media_type;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::collections::HashSet;

    struct FakePage {
        html_by_url: HashMap<String, String>,
        fail_goto: bool,
        visited: Vec<String>,
        current: String,
    }

    impl FakePage {
        fn new(html_by_url: HashMap<String, String>) -> Self {
            Self {
                html_by_url,
                fail_goto: false,
                visited: Vec::new(),
                current: String::new(),
            }
        }
    }

    impl PostPage for FakePage {
        fn goto(&mut self, url: &str, _timeout_ms: u64) -> Result<()> {
            if self.fail_goto {
                return Err(ScrapeError::Navigation {
                    url: url.to_string(),
                    message: "timeout".to_string(),
                });
            }
            self.visited.push(url.to_string());
            self.current = url.to_string();
            Ok(())
        }

        fn content(&mut self) -> Result<String> {
            Ok(self
                .html_by_url
                .get(&self.current)
                .cloned()
                .unwrap_or_else(|| "<html><body></body></html>".to_string()))
        }

        fn user_agent(&mut self) -> Result<String> {
            Ok("TestAgent/1.0".to_string())
        }

        fn cookies(&mut self) -> Result<Vec<(String, String)>> {
            Ok(vec![("session".to_string(), "abc".to_string())])
        }

        fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    /// Writes a fixed payload to the quarantine path; URLs listed in
    /// `fail_urls` error without writing anything.
    struct FakeFetcher {
        payload: Vec<u8>,
        fail_urls: HashSet<String>,
        headers_seen: RefCell<Vec<RequestHeaders>>,
    }

    impl FakeFetcher {
        fn jpeg() -> Self {
            let mut payload = vec![0xff, 0xd8, 0xff, 0xe0];
            payload.extend(std::iter::repeat(0x22).take(64));
            Self {
                payload,
                fail_urls: HashSet::new(),
                headers_seen: RefCell::new(Vec::new()),
            }
        }
    }

    impl MediaFetcher for FakeFetcher {
        fn fetch(
            &self,
            url: &str,
            quarantine_path: &Path,
            headers: &RequestHeaders,
            _policy: &MediaSafetyPolicy,
        ) -> Result<DownloadInfo> {
            self.headers_seen.borrow_mut().push(headers.clone());
            if self.fail_urls.contains(url) {
                return Err(ScrapeError::MediaValidation("HTTP 500".to_string()));
            }
            if let Some(parent) = quarantine_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(quarantine_path, &self.payload)?;
            Ok(DownloadInfo {
                bytes_written: self.payload.len() as u64,
                detected_type: detect_media_type(&self.payload),
            })
        }
    }

    fn post_html(image_src: &str) -> String {
        format!(
            r##"<html><body>
            <nav>
              <section id="Tagsleft"><h4>Tags</h4><a class="tag_name">glasses</a></section>
            </nav>
            <div class="image-list"><a href="#"><img id="main_image" src="{image_src}"></a></div>
            </body></html>"##
        )
    }

    fn settings(dir: &Path) -> ProcessSettings {
        ProcessSettings {
            download_dir: dir.to_path_buf(),
            layout: StorageLayout {
                layout: ImageLayout::Flat,
                bucket_size: 1000,
            },
            timeout_ms: 5_000,
            strict_media_safety: false,
        }
    }

    fn open_store(dir: &Path) -> MetadataStore {
        MetadataStore::open(&dir.join("metadata.db")).expect("open store")
    }

    #[test]
    fn saves_media_and_persists_the_record() {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = "https://soybooru.com/post/view/101";
        let mut page = FakePage::new(HashMap::from([(
            url.to_string(),
            post_html("/_images/abc/101.jpg"),
        )]));
        let fetcher = FakeFetcher::jpeg();
        let mut store = open_store(dir.path());
        let mut log = |_: &str, _: &str, _: serde_json::Value| {};

        let outcome = process_post(
            &mut page,
            &fetcher,
            &mut store,
            url,
            &settings(dir.path()),
            &TagFilters::default(),
            &mut log,
        )
        .expect("process");

        assert_eq!(
            outcome,
            PostOutcome::Saved {
                post_number: 101,
                downloaded: 1,
                already_present: 0,
                failed: 0,
                files: vec!["101_soyjak.jpg".to_string()],
            }
        );
        assert!(dir.path().join("101_soyjak.jpg").is_file());
        let record = store.get(101).expect("get").expect("record");
        assert_eq!(record.tag_data.tags, vec!["glasses"]);
        assert_eq!(record.files, vec!["101_soyjak.jpg"]);

        let headers = fetcher.headers_seen.borrow();
        assert_eq!(headers[0].referer.as_deref(), Some(url));
        assert_eq!(headers[0].user_agent.as_deref(), Some("TestAgent/1.0"));
        assert_eq!(headers[0].cookie.as_deref(), Some("session=abc"));
    }

    #[test]
    fn bucket_layout_places_files_in_the_post_bucket() {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = "https://soybooru.com/post/view/1234";
        let mut page = FakePage::new(HashMap::from([(
            url.to_string(),
            post_html("/_images/abc/1234.jpg"),
        )]));
        let fetcher = FakeFetcher::jpeg();
        let mut store = open_store(dir.path());
        let mut log = |_: &str, _: &str, _: serde_json::Value| {};

        let mut settings = settings(dir.path());
        settings.layout = StorageLayout::default();
        process_post(
            &mut page,
            &fetcher,
            &mut store,
            url,
            &settings,
            &TagFilters::default(),
            &mut log,
        )
        .expect("process");

        assert!(dir
            .path()
            .join("001000-001999")
            .join("1234_soyjak.jpg")
            .is_file());
    }

    #[test]
    fn filtered_posts_are_skipped_before_any_download() {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = "https://soybooru.com/post/view/7";
        let mut page = FakePage::new(HashMap::from([(
            url.to_string(),
            post_html("/_images/abc/7.jpg"),
        )]));
        let fetcher = FakeFetcher::jpeg();
        let mut store = open_store(dir.path());
        let mut log = |_: &str, _: &str, _: serde_json::Value| {};

        let filters = TagFilters {
            skip_nsfw: true,
            nsfw_blocklist: HashSet::from(["glasses".to_string()]),
            ..TagFilters::default()
        };
        let outcome = process_post(
            &mut page,
            &fetcher,
            &mut store,
            url,
            &settings(dir.path()),
            &filters,
            &mut log,
        )
        .expect("process");

        assert_eq!(
            outcome,
            PostOutcome::Filtered {
                post_number: 7,
                category: "NSFW",
                tag: "glasses".to_string(),
            }
        );
        assert!(fetcher.headers_seen.borrow().is_empty());
        assert!(store.get(7).expect("get").is_none());
    }

    #[test]
    fn blocklisted_text_outside_the_tags_field_does_not_filter() {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = "https://soybooru.com/post/view/8";
        let html = r##"<html><body>
            <nav>
              <section id="Tagsleft"><h4>Tags</h4><a class="tag_name">glasses</a></section>
              <section id="Flagleft"><h4>Flag</h4><a>lithuania</a></section>
            </nav>
            <div class="image-list"><a href="#"><img id="main_image" src="/_images/abc/8.jpg"></a></div>
            </body></html>"##;
        let mut page = FakePage::new(HashMap::from([(url.to_string(), html.to_string())]));
        let fetcher = FakeFetcher::jpeg();
        let mut store = open_store(dir.path());
        let mut log = |_: &str, _: &str, _: serde_json::Value| {};

        let filters = TagFilters {
            skip_nsfw: true,
            nsfw_blocklist: HashSet::from(["lithuania".to_string()]),
            ..TagFilters::default()
        };
        let outcome = process_post(
            &mut page,
            &fetcher,
            &mut store,
            url,
            &settings(dir.path()),
            &filters,
            &mut log,
        )
        .expect("process");

        assert!(matches!(outcome, PostOutcome::Saved { downloaded: 1, .. }));
        assert_eq!(fetcher.headers_seen.borrow().len(), 1);
        assert!(dir.path().join("8_soyjak.jpg").is_file());
    }

    #[test]
    fn page_without_media_is_a_no_images_outcome() {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = "https://soybooru.com/post/view/9";
        let mut page = FakePage::new(HashMap::from([(
            url.to_string(),
            "<html><body><p>deleted</p></body></html>".to_string(),
        )]));
        let fetcher = FakeFetcher::jpeg();
        let mut store = open_store(dir.path());
        let mut log = |_: &str, _: &str, _: serde_json::Value| {};

        let outcome = process_post(
            &mut page,
            &fetcher,
            &mut store,
            url,
            &settings(dir.path()),
            &TagFilters::default(),
            &mut log,
        )
        .expect("process");
        assert_eq!(outcome, PostOutcome::NoImages { post_number: 9 });
        assert!(store.get(9).expect("get").is_none());
    }

    #[test]
    fn already_present_file_short_circuits_the_download() {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = "https://soybooru.com/post/view/55";
        std::fs::write(dir.path().join("55_soyjak.jpg"), b"existing").expect("seed file");

        let mut page = FakePage::new(HashMap::from([(
            url.to_string(),
            post_html("/_images/abc/55.jpg"),
        )]));
        let fetcher = FakeFetcher::jpeg();
        let mut store = open_store(dir.path());
        let mut log = |_: &str, _: &str, _: serde_json::Value| {};

        let outcome = process_post(
            &mut page,
            &fetcher,
            &mut store,
            url,
            &settings(dir.path()),
            &TagFilters::default(),
            &mut log,
        )
        .expect("process");

        assert_eq!(
            outcome,
            PostOutcome::Saved {
                post_number: 55,
                downloaded: 0,
                already_present: 1,
                failed: 0,
                files: vec!["55_soyjak.jpg".to_string()],
            }
        );
        assert!(fetcher.headers_seen.borrow().is_empty());
        assert_eq!(
            std::fs::read(dir.path().join("55_soyjak.jpg")).expect("read"),
            b"existing"
        );
    }

    #[test]
    fn sniffed_extension_collision_keeps_the_existing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = "https://soybooru.com/post/view/70";
        // URL says .png so the pre-download check misses, but the fetched
        // bytes sniff as .jpg and collide with the file already on disk.
        std::fs::write(dir.path().join("70_soyjak.jpg"), b"original").expect("seed file");

        let mut page = FakePage::new(HashMap::from([(
            url.to_string(),
            post_html("/_images/abc/70.png"),
        )]));
        let fetcher = FakeFetcher::jpeg();
        let mut store = open_store(dir.path());
        let mut log = |_: &str, _: &str, _: serde_json::Value| {};

        let outcome = process_post(
            &mut page,
            &fetcher,
            &mut store,
            url,
            &settings(dir.path()),
            &TagFilters::default(),
            &mut log,
        )
        .expect("process");

        assert_eq!(
            outcome,
            PostOutcome::Saved {
                post_number: 70,
                downloaded: 0,
                already_present: 1,
                failed: 0,
                files: vec!["70_soyjak.jpg".to_string()],
            }
        );
        assert_eq!(
            std::fs::read(dir.path().join("70_soyjak.jpg")).expect("read"),
            b"original"
        );
        let quarantine_dir = dir.path().join(QUARANTINE_DIR_NAME);
        let leftovers = std::fs::read_dir(&quarantine_dir)
            .map(|entries| entries.count())
            .unwrap_or(0);
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn one_bad_url_does_not_abort_the_others() {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = "https://soybooru.com/post/view/60";
        // two media URLs via <source> children
        let html = r#"<html><body>
            <video id="main_image">
              <source src="/_images/a/60.mp4">
              <source src="/_images/b/60.mp4">
            </video>
            </body></html>"#;
        let mut page = FakePage::new(HashMap::from([(url.to_string(), html.to_string())]));
        let mut fetcher = FakeFetcher::jpeg();
        fetcher
            .fail_urls
            .insert("https://soybooru.com/_images/a/60.mp4".to_string());
        let mut store = open_store(dir.path());
        let mut log = |_: &str, _: &str, _: serde_json::Value| {};

        let outcome = process_post(
            &mut page,
            &fetcher,
            &mut store,
            url,
            &settings(dir.path()),
            &TagFilters::default(),
            &mut log,
        )
        .expect("process");

        assert_eq!(
            outcome,
            PostOutcome::Saved {
                post_number: 60,
                downloaded: 1,
                already_present: 0,
                failed: 1,
                files: vec!["60_soyjak_1.jpg".to_string()],
            }
        );
        assert!(!dir.path().join("60_soyjak.jpg").exists());
        let record = store.get(60).expect("get").expect("record");
        assert_eq!(record.image_urls.len(), 2);
        assert_eq!(record.files, vec!["60_soyjak_1.jpg"]);
    }

    #[test]
    fn all_urls_failing_is_a_hard_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = "https://soybooru.com/post/view/12";
        let mut page = FakePage::new(HashMap::from([(
            url.to_string(),
            post_html("/_images/abc/12.jpg"),
        )]));
        let mut fetcher = FakeFetcher::jpeg();
        fetcher
            .fail_urls
            .insert("https://soybooru.com/_images/abc/12.jpg".to_string());
        let mut store = open_store(dir.path());
        let mut log = |_: &str, _: &str, _: serde_json::Value| {};

        let err = process_post(
            &mut page,
            &fetcher,
            &mut store,
            url,
            &settings(dir.path()),
            &TagFilters::default(),
            &mut log,
        )
        .expect_err("all downloads failed");
        assert!(matches!(
            err,
            ScrapeError::AllDownloadsFailed { post_number: 12 }
        ));
        assert!(store.get(12).expect("get").is_none());
    }

    #[test]
    fn navigation_failure_surfaces_as_navigation_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = "https://soybooru.com/post/view/3";
        let mut page = FakePage::new(HashMap::new());
        page.fail_goto = true;
        let fetcher = FakeFetcher::jpeg();
        let mut store = open_store(dir.path());
        let mut log = |_: &str, _: &str, _: serde_json::Value| {};

        let err = process_post(
            &mut page,
            &fetcher,
            &mut store,
            url,
            &settings(dir.path()),
            &TagFilters::default(),
            &mut log,
        )
        .expect_err("navigation fails");
        assert!(matches!(err, ScrapeError::Navigation { .. }));
    }

    #[test]
    fn post_number_parsing_rejects_non_numeric_urls() {
        assert_eq!(
            post_number_from_url("https://soybooru.com/post/view/101").expect("number"),
            101
        );
        assert!(post_number_from_url("https://soybooru.com/post/list").is_err());
        assert!(post_number_from_url("not a url").is_err());
    }
}
