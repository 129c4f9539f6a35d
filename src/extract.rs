use crate::models::TagData;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::collections::HashSet;
use url::Url;

/// Section ids that never hold tag data.
const IGNORED_SECTION_IDS: &[&str] = &[
    "post_controlsleft",
    "report_postleft",
    "navigationleft",
    "advertisementleft",
    "statisticsleft",
];

/// Ordered media-element patterns; markup has drifted over the site's life,
/// so the first pattern that matches anything wins.
const IMAGE_SELECTORS: &[&str] = &[
    "div.image-list > a:first-child img#main_image",
    "img#main_image",
    "video#main_image source",
    "video#main_image",
    "div.image-list > a:first-child video source",
    "div.image-list > a:first-child video",
];

const STATISTICS_LABELS: &[&str] = &["Posted", "Size", "Filesize", "Type", "Rating"];

/// Maps a section id/heading to a canonical tag-data key: strips the site's
/// trailing "left" marker, lowercases, and folds singular/plural variants.
fn normalize_section_key(raw: &str) -> String {
    let mut cleaned = raw.trim().to_string();
    if cleaned.len() >= 4 && cleaned[cleaned.len() - 4..].eq_ignore_ascii_case("left") {
        cleaned.truncate(cleaned.len() - 4);
    }
    let cleaned = cleaned.replace('_', " ").trim().to_ascii_lowercase();
    if cleaned.is_empty() {
        return String::new();
    }
    match cleaned.as_str() {
        "variant" | "variants" => "variants".to_string(),
        "subvariant" | "subvariants" => "subvariants".to_string(),
        "tag" | "tags" => "tags".to_string(),
        "flag" | "flags" => "flags".to_string(),
        "meta" | "metas" => "meta".to_string(),
        other => other.split_whitespace().collect::<Vec<_>>().join("_"),
    }
}

fn element_text(el: &ElementRef<'_>) -> String {
    el.text().collect::<Vec<_>>().join(" ").trim().to_string()
}

fn section_heading(section: &ElementRef<'_>) -> String {
    let selector = Selector::parse("h4, h3, h2, h1").expect("heading selector");
    section
        .select(&selector)
        .next()
        .map(|el| element_text(&el))
        .unwrap_or_default()
}

fn is_ignored_section(id: &str, heading: &str) -> bool {
    let id = id.to_ascii_lowercase();
    if !id.is_empty() && IGNORED_SECTION_IDS.contains(&id.as_str()) {
        return true;
    }
    heading.to_ascii_lowercase().contains("favorited")
}

fn collect_section_tags(section: &ElementRef<'_>) -> Vec<String> {
    let tag_name = Selector::parse(".tag_name").expect("tag_name selector");
    let mut values: Vec<String> = section
        .select(&tag_name)
        .map(|el| element_text(&el))
        .filter(|text| !text.is_empty())
        .collect();
    if values.is_empty() {
        let fallback = Selector::parse("tbody a, a").expect("section anchor selector");
        values = section
            .select(&fallback)
            .map(|el| element_text(&el))
            .filter(|text| !text.is_empty())
            .collect();
    }
    values
}

fn extract_section_tag_data(document: &Html) -> TagData {
    let sections = Selector::parse("body nav section").expect("section selector");
    let mut data = TagData::default();
    for section in document.select(&sections) {
        let id = section.value().attr("id").unwrap_or("").trim();
        let heading = section_heading(&section);
        if is_ignored_section(id, &heading) {
            continue;
        }
        let key_source = if id.is_empty() { heading.as_str() } else { id };
        let key = normalize_section_key(key_source);
        if key.is_empty() {
            continue;
        }
        let tags = collect_section_tags(&section);
        if tags.is_empty() {
            continue;
        }
        data.insert_values(&key, tags);
    }
    data
}

/// Pulls the value following `label:` out of collapsed statistics text,
/// stopping at the next known label.
fn extract_labeled_value(text: &str, label: &str) -> Option<String> {
    let others = STATISTICS_LABELS
        .iter()
        .filter(|candidate| !candidate.eq_ignore_ascii_case(label))
        .map(|candidate| regex::escape(candidate))
        .collect::<Vec<_>>()
        .join("|");
    let pattern = format!(
        r"(?i){}\s*:\s*(.*?)\s*(?:(?:{others})\s*:|$)",
        regex::escape(label)
    );
    let re = Regex::new(&pattern).expect("statistics label regex");
    let captured = re.captures(text)?.get(1)?.as_str().trim().to_string();
    if captured.is_empty() {
        None
    } else {
        Some(captured)
    }
}

fn extract_statistics(document: &Html) -> TagData {
    let mut data = TagData::default();
    let section_selector =
        Selector::parse("body nav section#Statisticsleft").expect("statistics selector");
    let Some(section) = document.select(&section_selector).next() else {
        return data;
    };

    let time_selector = Selector::parse("div.navside.tab time, time").expect("time selector");
    if let Some(time_el) = section.select(&time_selector).next() {
        let posted_at = time_el
            .value()
            .attr("datetime")
            .map(str::to_string)
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| element_text(&time_el));
        data.set_scalar("postedAt", &posted_at);
    }

    let text = element_text(&section)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    for (label, key) in [
        ("Size", "size"),
        ("Filesize", "filesize"),
        ("Type", "type"),
        ("Rating", "rating"),
    ] {
        if let Some(value) = extract_labeled_value(&text, label) {
            data.set_scalar(key, &value);
        }
    }
    data
}

fn extract_legacy_tag_data(document: &Html) -> TagData {
    let mut data = TagData::default();
    let variant_selector = Selector::parse(
        "#Variantleft tbody tr td:nth-child(2) a, #Variantsleft tbody tr td:nth-child(2) a",
    )
    .expect("legacy variant selector");
    let variants: Vec<String> = document
        .select(&variant_selector)
        .map(|el| element_text(&el))
        .filter(|text| !text.is_empty())
        .collect();
    data.insert_values("variants", variants);

    let tags_selector = Selector::parse("#Tagsleft .tag_name").expect("legacy tags selector");
    let tags: Vec<String> = document
        .select(&tags_selector)
        .map(|el| element_text(&el))
        .filter(|text| !text.is_empty())
        .collect();
    data.insert_values("tags", tags);
    data
}

/// Extracts normalized tag data from a rendered post page. Absence is a
/// normal outcome (older posts, markup drift) and comes back as `None`.
pub fn extract_tag_data(document: &Html) -> Option<TagData> {
    let mut data = extract_section_tag_data(document);
    let statistics = extract_statistics(document);

    if !statistics.is_empty() {
        if let Some(posted_at) = statistics.posted_at {
            data.posted_at = Some(posted_at);
        }
        if let Some(size) = statistics.size {
            data.size = Some(size);
        }
        if let Some(filesize) = statistics.filesize {
            data.filesize = Some(filesize);
        }
        if let Some(media_type) = statistics.media_type {
            data.media_type = Some(media_type);
        }
        if let Some(rating) = statistics.rating {
            data.rating = Some(rating);
        }
    }
    if !data.is_empty() {
        return Some(data);
    }

    let legacy = extract_legacy_tag_data(document);
    if legacy.is_empty() {
        None
    } else {
        Some(legacy)
    }
}

/// Resolved, de-duplicated media URLs from the rendered post page. The
/// selector patterns are tried in priority order; the first one yielding any
/// URL wins. An empty result means nothing to download, not an error.
pub fn extract_image_urls(document: &Html, referer: &str) -> Vec<String> {
    let Ok(base) = Url::parse(referer) else {
        return Vec::new();
    };

    for raw_selector in IMAGE_SELECTORS {
        let selector = Selector::parse(raw_selector).expect("image selector");
        let mut urls: Vec<String> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        for element in document.select(&selector) {
            let raw = element
                .value()
                .attr("src")
                .or_else(|| element.value().attr("data-src"))
                .unwrap_or("")
                .trim();
            if raw.is_empty() {
                continue;
            }
            let Ok(resolved) = base.join(raw) else {
                continue;
            };
            let resolved = resolved.to_string();
            if seen.insert(resolved.clone()) {
                urls.push(resolved);
            }
        }
        if !urls.is_empty() {
            return urls;
        }
    }
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    const POST_HTML: &str = r#"
    <html><body><nav>
      <section id="Variantleft">
        <h4>Variant</h4>
        <table><tbody>
          <tr><td><a class="tag_name">classic</a></td></tr>
          <tr><td><a class="tag_name">classic</a></td></tr>
          <tr><td><a class="tag_name">cobson</a></td></tr>
        </tbody></table>
      </section>
      <section id="Tagsleft">
        <h4>Tags</h4>
        <a class="tag_name">glasses</a>
        <a class="tag_name">stubble</a>
      </section>
      <section id="Flagleft">
        <h4>Flag</h4>
        <a>lithuania</a>
      </section>
      <section id="Navigationleft"><a>Next</a></section>
      <section><h4>Favorited By</h4><a>someone</a></section>
      <section id="Statisticsleft">
        <h4>Statistics</h4>
        <div class="navside tab"><time datetime="2024-05-01T10:00:00Z">May 1</time></div>
        Posted: May 1 Size: 640x480 Filesize: 12.1KB Type: image Rating: Safe
      </section>
    </nav>
    <div class="image-list">
      <a href="/full"><img id="main_image" src="/_images/abc123/101.jpg"></a>
    </div>
    </body></html>
    "#;

    #[test]
    fn section_strategy_groups_and_dedupes_by_normalized_key() {
        let doc = Html::parse_document(POST_HTML);
        let data = extract_tag_data(&doc).expect("tag data");
        assert_eq!(data.variants, vec!["classic", "cobson"]);
        assert_eq!(data.tags, vec!["glasses", "stubble"]);
        assert_eq!(data.extra.get("flags"), Some(&vec!["lithuania".to_string()]));
        assert!(!data.extra.contains_key("navigation"));
        assert!(!data.extra.contains_key("favorited_by"));
    }

    #[test]
    fn statistics_scalars_stop_at_the_next_label() {
        let doc = Html::parse_document(POST_HTML);
        let data = extract_tag_data(&doc).expect("tag data");
        assert_eq!(data.posted_at.as_deref(), Some("2024-05-01T10:00:00Z"));
        assert_eq!(data.size.as_deref(), Some("640x480"));
        assert_eq!(data.filesize.as_deref(), Some("12.1KB"));
        assert_eq!(data.media_type.as_deref(), Some("image"));
        assert_eq!(data.rating.as_deref(), Some("Safe"));
    }

    #[test]
    fn legacy_fallback_kicks_in_when_nav_sections_are_missing() {
        let html = r#"
        <html><body>
          <div id="Variantsleft"><table><tbody>
            <tr><td>1</td><td><a>markiplier</a></td></tr>
          </tbody></table></div>
          <div id="Tagsleft"><span class="tag_name">smile</span></div>
        </body></html>
        "#;
        let doc = Html::parse_document(html);
        let data = extract_tag_data(&doc).expect("legacy data");
        assert_eq!(data.variants, vec!["markiplier"]);
        assert_eq!(data.tags, vec!["smile"]);
    }

    #[test]
    fn no_tag_markup_yields_none() {
        let doc = Html::parse_document("<html><body><p>nothing here</p></body></html>");
        assert!(extract_tag_data(&doc).is_none());
    }

    #[test]
    fn normalize_section_key_strips_left_suffix_and_canonicalizes() {
        assert_eq!(normalize_section_key("Variantleft"), "variants");
        assert_eq!(normalize_section_key("Variants"), "variants");
        assert_eq!(normalize_section_key("Tagsleft"), "tags");
        assert_eq!(normalize_section_key("Subvariantleft"), "subvariants");
        assert_eq!(normalize_section_key("Post Infoleft"), "post_info");
        assert_eq!(normalize_section_key(""), "");
    }

    #[test]
    fn image_urls_resolve_against_the_post_url() {
        let doc = Html::parse_document(POST_HTML);
        let urls = extract_image_urls(&doc, "https://soybooru.com/post/view/101");
        assert_eq!(
            urls,
            vec!["https://soybooru.com/_images/abc123/101.jpg".to_string()]
        );
    }

    #[test]
    fn video_source_pattern_is_tried_when_no_image_matches() {
        let html = r#"
        <html><body>
          <video id="main_image"><source src="/_images/def/202.mp4"></video>
        </body></html>
        "#;
        let doc = Html::parse_document(html);
        let urls = extract_image_urls(&doc, "https://soybooru.com/post/view/202");
        assert_eq!(
            urls,
            vec!["https://soybooru.com/_images/def/202.mp4".to_string()]
        );
    }

    #[test]
    fn first_matching_selector_strategy_wins() {
        let html = r#"
        <html><body><div class="image-list"><a>
          <img id="main_image" src="/a.jpg">
        </a></div>
        <img id="main_image" data-src="/a.jpg">
        </body></html>
        "#;
        let doc = Html::parse_document(html);
        let urls = extract_image_urls(&doc, "https://soybooru.com/post/view/1");
        assert_eq!(urls, vec!["https://soybooru.com/a.jpg".to_string()]);
    }

    #[test]
    fn pages_without_media_yield_an_empty_list() {
        let doc = Html::parse_document("<html><body><p>deleted</p></body></html>");
        assert!(extract_image_urls(&doc, "https://soybooru.com/post/view/9").is_empty());
    }
}
