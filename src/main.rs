use std::{sync::Arc, time::Duration};

use anyhow::Context;
use axum::http::{header::CONTENT_TYPE, HeaderName, Method};
use dotenv::dotenv;
use sqlx::postgres::PgPoolOptions;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::EnvFilter;

use escrowline::{
    config::{Config, GatewayMode, StoreBackend},
    db::{db::DBClient, memorydb::MemoryStore, store::EscrowStore},
    routes::create_router,
    service::{
        advisory_service::{AdvisoryClient, DisabledAdvisory, HttpAdvisoryClient},
        background_jobs::WorkerRegistry,
        notification_service::{ChannelDispatcher, HttpSink, LogSink, NotificationSink},
        payment_provider::{PaymentGateway, PaymentProviderService, StubPaymentGateway},
    },
    AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::init().context("invalid configuration")?;

    let store: Arc<dyn EscrowStore> = match config.store {
        StoreBackend::Postgres => {
            let pool = PgPoolOptions::new()
                .max_connections(20)
                .min_connections(5)
                .connect(&config.database_url)
                .await
                .context("failed to connect to the database")?;
            tracing::info!(max_connections = 20, "✅ Connection to the database is successful");

            let db_client = DBClient::new(pool);
            db_client.migrate().await.context("failed to apply migrations")?;
            Arc::new(db_client)
        }
        StoreBackend::Memory => {
            tracing::warn!("Running on the in-memory store; state is lost on restart");
            Arc::new(MemoryStore::new())
        }
    };

    let gateway: Arc<dyn PaymentGateway> = match config.gateway_mode {
        GatewayMode::Http => Arc::new(
            PaymentProviderService::new(
                config.gateway_base_url.clone(),
                config.gateway_secret_key.clone(),
                Duration::from_secs(config.gateway_timeout_secs),
            )
            .context("failed to build the payment gateway client")?,
        ),
        GatewayMode::Stub => {
            tracing::warn!("Using the stub payment gateway");
            Arc::new(StubPaymentGateway::new())
        }
    };

    let advisory: Arc<dyn AdvisoryClient> = match &config.advisory_url {
        Some(url) => Arc::new(HttpAdvisoryClient::new(url.clone())),
        None => Arc::new(DisabledAdvisory),
    };

    let sink: Arc<dyn NotificationSink> = match &config.notification_webhook_url {
        Some(url) => Arc::new(
            HttpSink::new(url.clone(), Duration::from_secs(5)).context("failed to build the notification client")?,
        ),
        None => Arc::new(LogSink),
    };

    let (dispatcher, notices) = ChannelDispatcher::new(config.notification_queue_capacity);
    let app_state = Arc::new(AppState::new(
        config.clone(),
        store,
        gateway,
        Arc::new(dispatcher),
        advisory,
    ));

    let mut workers = WorkerRegistry::new();
    workers.start(app_state.clone(), notices, sink);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_headers([
            CONTENT_TYPE,
            HeaderName::from_static("idempotency-key"),
            HeaderName::from_static("x-request-id"),
        ])
        .allow_methods([Method::GET, Method::POST]);

    let app = create_router(app_state).layer(cors);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port))
        .await
        .with_context(|| format!("failed to bind port {}", config.port))?;
    tracing::info!(port = config.port, "🚀 Server is running");

    let shutdown = workers.cancel_token();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("Shutdown signal received"),
                _ = shutdown.cancelled() => {}
            }
        })
        .await
        .context("server error")?;

    workers.shutdown().await;
    Ok(())
}
