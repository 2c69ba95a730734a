/// Smoke-test for `ChromiumBackend`.
///
/// Launches a headless Chromium, opens an isolated context, loads
/// <https://example.com> with the default request filter, and reads the `<h1>`.
///
/// Run with:
///   cargo run -p tempo-client --example browser_smoke
use tempo_client::ChromiumBackend;
use tempo_core::intercept::RequestFilter;
use tempo_core::models::Locator;
use tempo_core::traits::{BrowserBackend, BrowserSession, BrowsingContext};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    println!("Launching headless browser…");
    let session = ChromiumBackend::default().launch().await?;

    println!("Probing…");
    session.probe().await?;

    let context = session.new_context().await?;
    context
        .navigate("https://example.com", &RequestFilter::default())
        .await?;
    let heading = context.read_text(&Locator::Css("h1".into())).await?;
    let by_text = context
        .read_text(&Locator::TextContains("Example Domain".into()))
        .await?;
    context.close().await?;
    session.close().await?;

    assert_eq!(heading.as_deref(), Some("Example Domain"));
    assert!(by_text.is_some(), "text locator found nothing");

    println!("OK, heading: {heading:?}");
    Ok(())
}
