mod error;
pub mod extract;
pub mod fetch;
pub mod files;
pub mod layout;
pub mod models;
pub mod options;
pub mod page;
pub mod paths;
pub mod planner;
pub mod processor;
pub mod runner;
pub mod safety;
pub mod store;
pub mod tags;

pub use error::{Result, ScrapeError};

/// Structured log sink shared by the long-running entry points: level, event
/// name, JSON payload. The host process decides where lines go.
pub type LogSink<'a> = &'a mut dyn FnMut(&str, &str, serde_json::Value);
