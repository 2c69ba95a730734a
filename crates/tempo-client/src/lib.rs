pub mod browser;

pub use browser::{ChromiumBackend, ChromiumContext, ChromiumSession, ChromiumSettings};
