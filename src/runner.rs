use crate::fetch::MediaFetcher;
use crate::files::downloaded_post_numbers;
use crate::layout::StorageLayout;
use crate::page::PostPage;
use crate::paths::ensure_download_dir;
use crate::planner::{plan_posts, with_retries, RetryPolicy};
use crate::processor::{process_post, PostOutcome, ProcessSettings};
use crate::safety::{ensure_virus_scanner_available, MediaSafetyPolicy};
use crate::store::MetadataStore;
use crate::tags::build_tag_filters;
use crate::{LogSink, Result, ScrapeError};
use rand::Rng;
use regex::Regex;
use scraper::{Html, Selector};
use serde_json::json;
use std::path::Path;

pub const SITE_BASE_URL: &str = "https://soybooru.com";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub planned: u64,
    pub saved: u64,
    pub filtered: u64,
    pub no_images: u64,
    pub failed: u64,
}

/// Base pacing delay with a uniform +/-25% jitter.
fn pace_delay_ms(base_ms: u64) -> u64 {
    if base_ms == 0 {
        return 0;
    }
    let low = base_ms - base_ms / 4;
    let high = base_ms + base_ms / 4;
    rand::thread_rng().gen_range(low..=high)
}

/// Highest post number linked from the site's post list, with retries. This
/// is the only operation that retries; individual posts get one attempt each.
pub fn get_max_post(
    page: &mut dyn PostPage,
    timeout_ms: u64,
    retry: &RetryPolicy,
    sleep: &mut dyn FnMut(u64),
    log: LogSink<'_>,
) -> Result<u64> {
    let list_url = format!("{SITE_BASE_URL}/post/list");
    let view_link = Regex::new(r"/post/view/(\d+)").expect("post link regex");
    let thumb = Selector::parse("a.thumb").expect("thumb selector");

    with_retries(retry, sleep, |attempt| {
        if attempt > 0 {
            log(
                "warn",
                "max_post_retry",
                json!({ "attempt": attempt, "url": list_url }),
            );
        }
        page.goto(&list_url, timeout_ms)?;
        let html = page.content()?;
        let document = Html::parse_document(&html);
        document
            .select(&thumb)
            .filter_map(|el| el.value().attr("href"))
            .filter_map(|href| view_link.captures(href))
            .filter_map(|caps| caps.get(1)?.as_str().parse::<u64>().ok())
            .max()
            .ok_or_else(|| ScrapeError::Navigation {
                url: list_url.clone(),
                message: "no post links on list page".to_string(),
            })
    })
}

/// One full run: preflight, plan, then visit every planned post with pacing
/// between posts and a consecutive-failure circuit breaker. The page is
/// closed on every exit path.
pub fn run_downloader(
    page: &mut dyn PostPage,
    fetcher: &dyn MediaFetcher,
    store: &mut MetadataStore,
    options: &crate::options::RunOptions,
    download_dir: &Path,
    sleep: &mut dyn FnMut(u64),
    log: LogSink<'_>,
) -> Result<RunSummary> {
    let result = run_inner(page, fetcher, store, options, download_dir, sleep, log);
    if let Err(err) = page.close() {
        log("warn", "page_close_failed", json!({ "error": err.to_string() }));
    }
    result
}

fn run_inner(
    page: &mut dyn PostPage,
    fetcher: &dyn MediaFetcher,
    store: &mut MetadataStore,
    options: &crate::options::RunOptions,
    download_dir: &Path,
    sleep: &mut dyn FnMut(u64),
    log: LogSink<'_>,
) -> Result<RunSummary> {
    options.validate()?;
    let filters = build_tag_filters(options);

    // Preflight before any network traffic: a missing scanner must stop the
    // run, not the first download.
    let preflight_policy = MediaSafetyPolicy::from_env(
        options.strict_media_safety,
        options.timeout_ms,
        SITE_BASE_URL,
    );
    ensure_virus_scanner_available(&preflight_policy)?;

    // An explicit --out-dir beats the host-resolved default.
    let download_dir = options.out_dir.as_deref().unwrap_or(download_dir);
    ensure_download_dir(download_dir)?;
    let downloaded = downloaded_post_numbers(download_dir)?;

    let remote_max = if !options.fill_gaps && options.end.is_none() {
        let retry = RetryPolicy::from_options(options);
        match get_max_post(page, options.timeout_ms, &retry, sleep, log) {
            Ok(max) => Some(max),
            // The plan falls back to a single-post range at `start`.
            Err(err) => {
                log(
                    "warn",
                    "max_post_lookup_failed",
                    json!({ "error": err.to_string() }),
                );
                None
            }
        }
    } else {
        None
    };

    let plan = plan_posts(options, &downloaded, remote_max);
    let mut summary = RunSummary {
        planned: plan.len(),
        ..RunSummary::default()
    };
    log(
        "info",
        "run_started",
        json!({
            "planned": summary.planned,
            "fillGaps": options.fill_gaps,
            "alreadyDownloaded": downloaded.len(),
        }),
    );
    if plan.is_empty() {
        log("info", "run_finished", json!({ "planned": 0 }));
        return Ok(summary);
    }

    let settings = ProcessSettings {
        download_dir: download_dir.to_path_buf(),
        layout: StorageLayout::from_env(),
        timeout_ms: options.timeout_ms,
        strict_media_safety: options.strict_media_safety,
    };
    let failure_ceiling = options.failure_ceiling();
    let mut consecutive_failures: u32 = 0;
    let total = plan.len();

    for (index, post_number) in plan.posts().enumerate() {
        let post_url = format!("{SITE_BASE_URL}/post/view/{post_number}");
        match process_post(page, fetcher, store, &post_url, &settings, &filters, log) {
            Ok(outcome) => {
                consecutive_failures = 0;
                match outcome {
                    PostOutcome::Saved { .. } => summary.saved += 1,
                    PostOutcome::Filtered { .. } => summary.filtered += 1,
                    PostOutcome::NoImages { .. } => summary.no_images += 1,
                }
            }
            Err(err) => {
                summary.failed += 1;
                consecutive_failures += 1;
                log(
                    "error",
                    "post_failed",
                    json!({
                        "post": post_number,
                        "error": err.to_string(),
                        "consecutiveFailures": consecutive_failures,
                    }),
                );
                if let Some(limit) = failure_ceiling {
                    if consecutive_failures >= limit {
                        log(
                            "error",
                            "run_aborted",
                            json!({ "consecutiveFailures": consecutive_failures }),
                        );
                        return Err(ScrapeError::RunAborted {
                            failures: consecutive_failures,
                        });
                    }
                }
                // Best-effort reload to shake off bad page state; a dead page
                // will just fail the next post too and trip the breaker.
                let _ = page.goto(&post_url, options.timeout_ms);
            }
        }

        if (index as u64) + 1 < total {
            sleep(pace_delay_ms(options.pace_base_ms));
        }
    }

    log(
        "info",
        "run_finished",
        json!({
            "planned": summary.planned,
            "saved": summary.saved,
            "filtered": summary.filtered,
            "noImages": summary.no_images,
            "failed": summary.failed,
        }),
    );
    Ok(summary)
}
