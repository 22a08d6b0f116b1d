use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use proctoring_backend::{
    config::{get_config, init_config},
    database::pool::create_pool,
    routes,
    services::{merge_queue, merge_service},
    AppState,
};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    init_config()?;
    let config = get_config();

    // This process runs merges, so a missing transcoder is fatal here
    // rather than at the first job.
    merge_service::check_transcoder(&config.ffmpeg_path).await?;

    let pool = create_pool().await?;
    sqlx::migrate!("./migrations").run(&pool).await?;

    let app_state = AppState::new(pool).await?;

    {
        let state = app_state.clone();
        tokio::spawn(async move {
            merge_queue::run_worker(
                state.merge_queue.clone(),
                state.pool.clone(),
                state.merge_service.clone(),
                state.proctoring.clone(),
            )
            .await;
        });
    }

    let api = Router::new()
        .route(
            "/api/proctoring/queue/stats",
            get(routes::proctoring::queue_stats),
        )
        .route(
            "/api/proctoring/:attempt_id",
            get(routes::proctoring::get_proctoring_detail),
        )
        .route(
            "/api/proctoring/:attempt_id/events",
            post(routes::proctoring::log_events),
        )
        .route(
            "/api/proctoring/:attempt_id/segments",
            post(routes::proctoring::upload_segment),
        )
        .route(
            "/api/proctoring/:attempt_id/segments/upload",
            post(routes::proctoring::upload_segment_multipart),
        )
        .route(
            "/api/proctoring/:attempt_id/media/:channel",
            get(routes::proctoring::stream_media),
        )
        .route(
            "/api/proctoring/:attempt_id/merge",
            post(routes::proctoring::enqueue_merge),
        );

    let app = Router::new()
        .route("/health", get(routes::health::health))
        .merge(api)
        .with_state(app_state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        // 8 MiB decoded segments arrive base64-expanded, leave headroom.
        .layer(DefaultBodyLimit::max(16 * 1024 * 1024));

    let addr: SocketAddr = config.server_address.parse()?;
    info!("Server listening on {}", addr);
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
