use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chromiumoxide::cdp::browser_protocol::browser::{BrowserContextId, CloseParams};
use chromiumoxide::cdp::browser_protocol::fetch::{
    ContinueRequestParams, EnableParams, EventRequestPaused, FailRequestParams, RequestPattern,
};
use chromiumoxide::cdp::browser_protocol::network::{ErrorReason, ResourceType};
use chromiumoxide::cdp::browser_protocol::target::{
    CreateBrowserContextParams, CreateTargetParams, DisposeBrowserContextParams,
};
use chromiumoxide::error::CdpError;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use tempo_core::error::AppError;
use tempo_core::intercept::{RequestFilter, ResourceKind};
use tempo_core::models::Locator;
use tempo_core::traits::{BrowserBackend, BrowserSession, BrowsingContext};
use tokio::task::JoinHandle;

/// Flags for a headless browser in a small container.
const LAUNCH_ARGS: &[&str] = &[
    "--disable-gpu",
    "--disable-dev-shm-usage",
    "--disable-extensions",
    "--disable-popup-blocking",
    "--disable-translate",
    "--disable-background-networking",
    "--disable-background-timer-throttling",
    "--disable-renderer-backgrounding",
    "--disable-sync",
    "--metrics-recording-only",
    "--mute-audio",
    "--no-first-run",
    "--no-zygote",
];

/// How often an element lookup is retried while the page is still rendering.
const ELEMENT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Launch settings for [`ChromiumBackend`].
#[derive(Debug, Clone)]
pub struct ChromiumSettings {
    /// Browser binary. `None` searches `CHROME_BIN` and well-known paths.
    pub chrome_bin: Option<PathBuf>,
    /// Upper bound for a single CDP command.
    pub request_timeout: Duration,
    /// How long [`BrowsingContext::read_text`] waits for an element to appear.
    pub element_wait: Duration,
    /// Passed to the browser after the built-in flags.
    pub extra_args: Vec<String>,
}

impl Default for ChromiumSettings {
    fn default() -> Self {
        Self {
            chrome_bin: None,
            request_timeout: Duration::from_secs(30),
            element_wait: Duration::from_secs(10),
            extra_args: Vec::new(),
        }
    }
}

/// Headless Chromium driven over the Chrome DevTools Protocol.
///
/// Every [`launch`](BrowserBackend::launch) starts a separate browser
/// process. Scrapes share that process but each one runs in its own
/// browser context, so cookies and storage never leak between tasks.
///
/// # Example
///
/// ```rust,no_run
/// use tempo_client::ChromiumBackend;
/// use tempo_core::models::Locator;
/// use tempo_core::intercept::RequestFilter;
/// use tempo_core::traits::{BrowserBackend, BrowserSession, BrowsingContext};
///
/// # async fn run() -> Result<(), tempo_core::AppError> {
/// let session = ChromiumBackend::default().launch().await?;
/// let context = session.new_context().await?;
/// context.navigate("https://example.com", &RequestFilter::default()).await?;
/// let heading = context.read_text(&Locator::Css("h1".into())).await?;
/// context.close().await?;
/// session.close().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct ChromiumBackend {
    settings: ChromiumSettings,
}

impl ChromiumBackend {
    pub fn new(settings: ChromiumSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &ChromiumSettings {
        &self.settings
    }

    /// Tries to locate the real Chrome/Chromium binary.
    ///
    /// On systems where Chromium is installed via **snap**, the wrapper at
    /// `/snap/bin/chromium` strips unknown CLI flags, breaking headless mode.
    /// We look for the real binary inside the snap first, then fall back to
    /// well-known system paths. If nothing is found we return `None` and let
    /// `chromiumoxide` do its own lookup.
    fn find_chrome_binary() -> Option<PathBuf> {
        let candidates: &[&str] = &[
            "/snap/chromium/current/usr/lib/chromium-browser/chrome",
            "/var/lib/flatpak/exports/bin/org.chromium.Chromium",
            "/usr/bin/google-chrome-stable",
            "/usr/bin/google-chrome",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
        ];

        if let Ok(p) = std::env::var("CHROME_BIN") {
            let path = PathBuf::from(&p);
            if path.exists() {
                return Some(path);
            }
            tracing::warn!(path = %p, "CHROME_BIN does not exist, searching default locations");
        }

        candidates.iter().map(PathBuf::from).find(|p| p.exists())
    }
}

impl BrowserBackend for ChromiumBackend {
    type Session = ChromiumSession;

    async fn launch(&self) -> Result<ChromiumSession, AppError> {
        let mut builder = BrowserConfig::builder()
            .new_headless_mode()
            .no_sandbox()
            .disable_default_args()
            .request_timeout(self.settings.request_timeout);

        let binary = self
            .settings
            .chrome_bin
            .clone()
            .or_else(Self::find_chrome_binary);
        if let Some(bin) = binary {
            tracing::info!("Using Chrome binary: {}", bin.display());
            builder = builder.chrome_executable(bin);
        }
        for arg in LAUNCH_ARGS {
            builder = builder.arg(*arg);
        }
        for arg in &self.settings.extra_args {
            builder = builder.arg(arg.as_str());
        }

        let config = builder
            .build()
            .map_err(|e| AppError::BrowserUnavailable(format!("Browser config error: {e}")))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| AppError::BrowserUnavailable(format!("Failed to launch browser: {e}")))?;

        // The CDP handler must be polled continuously for the connection to work.
        let connected = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&connected);
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    tracing::debug!(error = %e, "Browser CDP handler error");
                }
            }
            flag.store(false, Ordering::SeqCst);
            tracing::debug!("Browser CDP connection closed");
        });

        Ok(ChromiumSession {
            browser: Arc::new(browser),
            connected,
            handler,
            element_wait: self.settings.element_wait,
        })
    }
}

/// One running Chromium process.
pub struct ChromiumSession {
    browser: Arc<Browser>,
    connected: Arc<AtomicBool>,
    handler: JoinHandle<()>,
    element_wait: Duration,
}

impl BrowserSession for ChromiumSession {
    type Context = ChromiumContext;

    async fn new_context(&self) -> Result<ChromiumContext, AppError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(AppError::ContextFailure(
                "browser connection lost".to_string(),
            ));
        }

        let created = self
            .browser
            .execute(CreateBrowserContextParams::default())
            .await
            .map_err(|e| context_failure("create browser context", e))?;
        let context_id = created.result.browser_context_id.clone();

        let target = CreateTargetParams::builder()
            .url("about:blank")
            .browser_context_id(context_id.clone())
            .build()
            .map_err(AppError::ContextFailure)?;

        match self.browser.new_page(target).await {
            Ok(page) => Ok(ChromiumContext {
                browser: Arc::clone(&self.browser),
                context_id,
                page,
                interceptor: Mutex::new(None),
                element_wait: self.element_wait,
            }),
            Err(e) => {
                dispose_context(&self.browser, context_id).await;
                Err(context_failure("open page", e))
            }
        }
    }

    async fn close(&self) -> Result<(), AppError> {
        // The browser usually drops the connection before answering.
        if let Err(e) = self.browser.execute(CloseParams::default()).await {
            tracing::debug!(error = %e, "Browser.close did not answer");
        }
        self.handler.abort();
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// An isolated browser context holding one page.
pub struct ChromiumContext {
    browser: Arc<Browser>,
    context_id: BrowserContextId,
    page: Page,
    interceptor: Mutex<Option<JoinHandle<()>>>,
    element_wait: Duration,
}

impl ChromiumContext {
    /// Pauses every request of the page and fails the ones `filter` rejects.
    async fn install_filter(&self, filter: &RequestFilter) -> Result<(), AppError> {
        // Listen before enabling so no paused request is missed.
        let mut paused = self
            .page
            .event_listener::<EventRequestPaused>()
            .await
            .map_err(|e| context_failure("listen for paused requests", e))?;

        let enable = EnableParams::builder()
            .patterns(vec![RequestPattern::builder().url_pattern("*").build()])
            .build();
        self.page
            .execute(enable)
            .await
            .map_err(|e| context_failure("enable request interception", e))?;

        let page = self.page.clone();
        let filter = filter.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = paused.next().await {
                let kind = resource_kind(&event.resource_type);
                let blocked = filter.should_block(kind, &event.request.url);
                let sent = if blocked {
                    tracing::trace!(url = %event.request.url, ?kind, "Blocking request");
                    page.execute(FailRequestParams::new(
                        event.request_id.clone(),
                        ErrorReason::BlockedByClient,
                    ))
                    .await
                    .map(|_| ())
                } else {
                    page.execute(ContinueRequestParams::new(event.request_id.clone()))
                        .await
                        .map(|_| ())
                };
                if let Err(e) = sent {
                    tracing::trace!(error = %e, "Paused request already gone");
                }
            }
        });

        let previous = self
            .interceptor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
        Ok(())
    }

    async fn find_text(&self, locator: &Locator) -> Result<Option<String>, CdpError> {
        let element = match locator {
            Locator::Css(selector) => self.page.find_element(selector.as_str()).await?,
            Locator::TextContains(needle) => self.page.find_xpath(text_xpath(needle)).await?,
        };
        Ok(element.inner_text().await?)
    }
}

impl BrowsingContext for ChromiumContext {
    async fn navigate(&self, url: &str, filter: &RequestFilter) -> Result<(), AppError> {
        if filter.is_active() {
            self.install_filter(filter).await?;
        }

        self.page.goto(url).await.map_err(|e| {
            if is_connection_error(&e) {
                context_failure("navigate", e)
            } else {
                AppError::NavigationFailure(format!("Failed to navigate to {url}: {e}"))
            }
        })?;
        Ok(())
    }

    /// Waits up to `element_wait` for the locator to match an element with
    /// non-blank text.
    async fn read_text(&self, locator: &Locator) -> Result<Option<String>, AppError> {
        let deadline = tokio::time::Instant::now() + self.element_wait;
        loop {
            match self.find_text(locator).await {
                Ok(Some(text)) if !text.trim().is_empty() => return Ok(Some(text)),
                Ok(_) => {}
                Err(e) if is_connection_error(&e) => {
                    return Err(context_failure("read element", e));
                }
                Err(e) => tracing::trace!(%locator, error = %e, "Element not there yet"),
            }
            if tokio::time::Instant::now() + ELEMENT_POLL_INTERVAL > deadline {
                return Ok(None);
            }
            tokio::time::sleep(ELEMENT_POLL_INTERVAL).await;
        }
    }

    async fn close(self) -> Result<(), AppError> {
        let ChromiumContext {
            browser,
            context_id,
            page,
            interceptor,
            ..
        } = self;

        let interceptor = interceptor
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(task) = interceptor {
            task.abort();
        }
        if let Err(e) = page.close().await {
            tracing::debug!(error = %e, "Failed to close page");
        }
        browser
            .execute(DisposeBrowserContextParams::new(context_id))
            .await
            .map_err(|e| context_failure("dispose browser context", e))?;
        Ok(())
    }
}

async fn dispose_context(browser: &Browser, context_id: BrowserContextId) {
    if let Err(e) = browser
        .execute(DisposeBrowserContextParams::new(context_id))
        .await
    {
        tracing::debug!(error = %e, "Failed to dispose browser context");
    }
}

/// Errors meaning the CDP connection itself is gone.
fn is_connection_error(e: &CdpError) -> bool {
    matches!(
        e,
        CdpError::Ws(_) | CdpError::ChannelSendError(_) | CdpError::NoResponse
    )
}

fn context_failure(action: &str, e: CdpError) -> AppError {
    AppError::ContextFailure(format!("Failed to {action}: {e}"))
}

fn resource_kind(resource_type: &ResourceType) -> ResourceKind {
    match resource_type {
        ResourceType::Document => ResourceKind::Document,
        ResourceType::Stylesheet => ResourceKind::Stylesheet,
        ResourceType::Image => ResourceKind::Image,
        ResourceType::Media => ResourceKind::Media,
        ResourceType::Font => ResourceKind::Font,
        ResourceType::Script => ResourceKind::Script,
        ResourceType::Xhr => ResourceKind::Xhr,
        ResourceType::Fetch => ResourceKind::Fetch,
        _ => ResourceKind::Other,
    }
}

/// XPath matching the first element whose own text contains `needle`.
fn text_xpath(needle: &str) -> String {
    format!("//*[contains(text(), {})]", xpath_literal(needle))
}

/// Quotes `s` as an XPath string literal, which has no escape syntax.
fn xpath_literal(s: &str) -> String {
    if !s.contains('\'') {
        format!("'{s}'")
    } else if !s.contains('"') {
        format!("\"{s}\"")
    } else {
        let parts: Vec<String> = s.split('\'').map(|p| format!("'{p}'")).collect();
        format!("concat({})", parts.join(", \"'\", "))
    }
}
