use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "tempo API",
        version = "0.1.0",
        description = "Scraping gateway for artist monthly listeners and track play counts."
    ),
    paths(
        crate::routes::monthly_listeners,
        crate::routes::play_count,
        crate::routes::health,
    ),
    components(schemas(
        crate::dto::MonthlyListenersResponse,
        crate::dto::PlayCountResponse,
        crate::dto::HealthResponse,
        crate::dto::ErrorResponse,
    )),
    tags(
        (name = "scrape", description = "On-demand figures, cached"),
        (name = "system", description = "Health and system status"),
    )
)]
pub struct ApiDoc;
