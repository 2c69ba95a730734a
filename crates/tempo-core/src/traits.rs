use std::future::Future;

use crate::error::AppError;
use crate::intercept::RequestFilter;
use crate::models::Locator;

/// Launches browser processes.
pub trait BrowserBackend: Send + Sync + 'static {
    type Session: BrowserSession;

    fn launch(&self) -> impl Future<Output = Result<Self::Session, AppError>> + Send;
}

/// One running browser process, shared by every in-flight scrape.
pub trait BrowserSession: Send + Sync + 'static {
    type Context: BrowsingContext;

    /// Opens a fresh isolated context (own cookies and storage) with one blank page.
    fn new_context(&self) -> impl Future<Output = Result<Self::Context, AppError>> + Send;

    /// Cheap liveness check: open an isolated context and close it again.
    fn probe(&self) -> impl Future<Output = Result<(), AppError>> + Send {
        async {
            let context = self.new_context().await?;
            context.close().await
        }
    }

    /// Shuts the browser down. Further calls on this session fail.
    fn close(&self) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// An isolated context with a single page.
pub trait BrowsingContext: Send + Sync {
    /// Installs `filter` on the page, then navigates to `url` and waits for
    /// the document to load.
    fn navigate(
        &self,
        url: &str,
        filter: &RequestFilter,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Text of the first element matched by `locator`, or `None` if nothing matches.
    fn read_text(
        &self,
        locator: &Locator,
    ) -> impl Future<Output = Result<Option<String>, AppError>> + Send;

    /// Closes the page and disposes of the context.
    fn close(self) -> impl Future<Output = Result<(), AppError>> + Send;
}
