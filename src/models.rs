use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Normalized tag metadata for one post. Array fields keep first-seen order
/// and suppress duplicates case-sensitively; section keys outside the fixed
/// set (e.g. "subvariants", "flags") land in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TagData {
    pub variants: Vec<String>,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub posted_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filesize: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rating: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Vec<String>>,
}

impl TagData {
    /// Merges values into the array field for `key`, preserving first-seen
    /// order and dropping duplicates within the field.
    pub fn insert_values<I>(&mut self, key: &str, values: I)
    where
        I: IntoIterator<Item = String>,
    {
        let target = match key {
            "variants" => &mut self.variants,
            "tags" => &mut self.tags,
            _ => self.extra.entry(key.to_string()).or_default(),
        };
        for value in values {
            if !target.contains(&value) {
                target.push(value);
            }
        }
    }

    pub fn set_scalar(&mut self, key: &str, value: &str) {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return;
        }
        let slot = match key {
            "postedAt" => &mut self.posted_at,
            "size" => &mut self.size,
            "filesize" => &mut self.filesize,
            "type" => &mut self.media_type,
            "rating" => &mut self.rating,
            _ => return,
        };
        *slot = Some(trimmed.to_string());
    }

    pub fn is_empty(&self) -> bool {
        self.variants.is_empty()
            && self.tags.is_empty()
            && self.posted_at.is_none()
            && self.size.is_none()
            && self.filesize.is_none()
            && self.media_type.is_none()
            && self.rating.is_none()
            && self.extra.values().all(|values| values.is_empty())
    }
}

/// Persisted record for one processed post, keyed by post number. Serialized
/// shape is the payload the search index reads, so field names stay camelCase
/// with the tag data spread at the top level.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostRecord {
    pub post_number: String,
    #[serde(flatten)]
    pub tag_data: TagData,
    pub post_url: String,
    pub image_urls: Vec<String>,
    pub files: Vec<String>,
    pub saved_at: u64,
}

impl PostRecord {
    pub fn new(
        post_number: u64,
        tag_data: TagData,
        post_url: &str,
        image_urls: Vec<String>,
        files: Vec<String>,
    ) -> Self {
        Self {
            post_number: post_number.to_string(),
            tag_data,
            post_url: post_url.to_string(),
            image_urls,
            files,
            saved_at: now_ms(),
        }
    }
}

pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
