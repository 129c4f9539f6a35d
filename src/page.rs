use crate::Result;

/// One browser page, provided by the host process. The scraper drives exactly
/// one of these at a time; rendering and process lifecycle stay outside the
/// crate.
pub trait PostPage {
    /// Navigates and waits for the page to settle, bounded by `timeout_ms`.
    fn goto(&mut self, url: &str, timeout_ms: u64) -> Result<()>;

    /// Rendered HTML of the current document.
    fn content(&mut self) -> Result<String>;

    /// The page's `navigator.userAgent`.
    fn user_agent(&mut self) -> Result<String>;

    /// Cookie jar as name/value pairs.
    fn cookies(&mut self) -> Result<Vec<(String, String)>>;

    /// Releases the page. Called on every run exit path; errors are the
    /// caller's to swallow.
    fn close(&mut self) -> Result<()>;
}
