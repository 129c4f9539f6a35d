use crate::options::RunOptions;
use std::collections::HashSet;
use std::path::Path;

/// Lowercases, maps underscores to spaces, and collapses runs of whitespace.
/// Both blocklist entries and extracted tags go through this before matching.
pub fn normalize_tag(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut last_was_space = true;
    for ch in value.trim().chars() {
        let ch = if ch == '_' { ' ' } else { ch };
        if ch.is_whitespace() {
            if !last_was_space {
                out.push(' ');
            }
            last_was_space = true;
        } else {
            out.extend(ch.to_lowercase());
            last_was_space = false;
        }
    }
    out.trim_end().to_string()
}

/// Newline-delimited blocklist file: blank lines and `#`/`//` comments are
/// ignored, remaining lines are normalized. A missing file yields an empty
/// set rather than an error.
pub fn load_tag_blocklist(path: &Path) -> HashSet<String> {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return HashSet::new();
    };
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with("//"))
        .map(normalize_tag)
        .filter(|tag| !tag.is_empty())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterMatch {
    pub category: &'static str,
    pub tag: String,
}

#[derive(Debug, Clone, Default)]
pub struct TagFilters {
    pub skip_nsfw: bool,
    pub skip_nsfl: bool,
    pub nsfw_blocklist: HashSet<String>,
    pub nsfl_blocklist: HashSet<String>,
}

impl TagFilters {
    pub fn is_active(&self) -> bool {
        self.skip_nsfw || self.skip_nsfl
    }

    /// First tag whose normalized form hits an active blocklist, NSFW checked
    /// before NSFL.
    pub fn find_blocked(&self, tags: &[String]) -> Option<FilterMatch> {
        if self.skip_nsfw {
            if let Some(tag) = first_blocked(tags, &self.nsfw_blocklist) {
                return Some(FilterMatch {
                    category: "NSFW",
                    tag,
                });
            }
        }
        if self.skip_nsfl {
            if let Some(tag) = first_blocked(tags, &self.nsfl_blocklist) {
                return Some(FilterMatch {
                    category: "NSFL",
                    tag,
                });
            }
        }
        None
    }
}

fn first_blocked(tags: &[String], blocklist: &HashSet<String>) -> Option<String> {
    if blocklist.is_empty() {
        return None;
    }
    tags.iter()
        .find(|tag| blocklist.contains(&normalize_tag(tag)))
        .cloned()
}

pub fn build_tag_filters(options: &RunOptions) -> TagFilters {
    let nsfw_blocklist = match (&options.nsfw_file, options.skip_nsfw) {
        (Some(path), true) => load_tag_blocklist(path),
        _ => HashSet::new(),
    };
    let nsfl_blocklist = match (&options.nsfl_file, options.skip_nsfl) {
        (Some(path), true) => load_tag_blocklist(path),
        _ => HashSet::new(),
    };
    TagFilters {
        skip_nsfw: options.skip_nsfw,
        skip_nsfl: options.skip_nsfl,
        nsfw_blocklist,
        nsfl_blocklist,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn normalize_tag_collapses_underscores_and_whitespace() {
        assert_eq!(normalize_tag("Gore_Tag"), "gore tag");
        assert_eq!(normalize_tag("  A   B\tC "), "a b c");
        assert_eq!(normalize_tag("plain"), "plain");
    }

    #[test]
    fn load_tag_blocklist_skips_comments_and_blanks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nsfw.txt");
        let mut file = std::fs::File::create(&path).expect("create");
        writeln!(file, "# comment").expect("write");
        writeln!(file, "// another").expect("write");
        writeln!(file).expect("write");
        writeln!(file, "Explicit_Tag").expect("write");
        writeln!(file, "  gore  ").expect("write");

        let set = load_tag_blocklist(&path);
        assert_eq!(set.len(), 2);
        assert!(set.contains("explicit tag"));
        assert!(set.contains("gore"));
    }

    #[test]
    fn load_tag_blocklist_missing_file_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(load_tag_blocklist(&dir.path().join("missing.txt")).is_empty());
    }

    #[test]
    fn find_blocked_matches_after_normalization() {
        let filters = TagFilters {
            skip_nsfw: true,
            nsfw_blocklist: HashSet::from(["explicit tag".to_string()]),
            ..TagFilters::default()
        };
        let tags = vec!["Harmless".to_string(), "Explicit_Tag".to_string()];
        let hit = filters.find_blocked(&tags).expect("match");
        assert_eq!(hit.category, "NSFW");
        assert_eq!(hit.tag, "Explicit_Tag");
    }

    #[test]
    fn inactive_filters_block_nothing() {
        let filters = TagFilters {
            skip_nsfw: false,
            nsfw_blocklist: HashSet::from(["gore".to_string()]),
            ..TagFilters::default()
        };
        assert!(filters.find_blocked(&["gore".to_string()]).is_none());
        assert!(!filters.is_active());
    }
}
