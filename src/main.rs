use anyhow::{Context, Result};
use polyglot_chat::{
    auth::JwtAuthenticator,
    channels::ChannelRegistry,
    config::Config,
    directory::PgDirectory,
    fanout::Fanout,
    i18n::LanguageResolver,
    media::DiskMediaStore,
    server::{create_router, AppState, MediaRoute},
    store::{create_pool, PgStore},
    translation::Translator,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (ignored in production)
    let _ = dotenvy::dotenv();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("polyglot_chat=info".parse()?)
                .add_directive("tower_http=info".parse()?),
        )
        .init();

    info!("Starting polyglot chat server");

    // Load configuration from environment
    let config = Config::from_env()?;

    // Persistence
    let pool = create_pool(&config.database_url).await?;
    let store = PgStore::new(pool.clone());
    store.init_schema().await?;
    let directory = PgDirectory::new(pool);
    directory.ensure_schema().await?;

    // Translation backends
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .context("Failed to build HTTP client")?;
    let translator = Arc::new(Translator::from_config(&config.translation, client));

    let fanout = Arc::new(Fanout::new(
        Arc::new(store),
        Arc::new(directory),
        Arc::clone(&translator),
        LanguageResolver::default(),
        Arc::new(ChannelRegistry::new()),
    ));

    let state = AppState {
        fanout,
        auth: Arc::new(JwtAuthenticator::new(&config.jwt_secret)),
        media: Arc::new(DiskMediaStore::new(&config.media_dir, &config.media_base_url)),
    };
    let media = MediaRoute {
        dir: config.media_dir.clone(),
        base_url: config.media_base_url.clone(),
    };
    let app = create_router(state, &media);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("{}", translator.metrics().report().format_summary());
    info!("Shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown signal received");
}
