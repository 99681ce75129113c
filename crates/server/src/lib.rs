mod auth;
mod error;
pub mod logger;

use std::net::SocketAddr;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use config::Config;
use gateway::{Gateway, HealthStatus};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub use error::Error;

pub(crate) type Result<T> = std::result::Result<T, error::Error>;

pub struct ServeConfig {
    pub listen_address: SocketAddr,
    pub config: Config,
    /// Cancelled to stop accepting connections and drain in-flight requests.
    pub shutdown: CancellationToken,
}

pub async fn serve(
    ServeConfig {
        listen_address,
        config,
        shutdown,
    }: ServeConfig,
) -> crate::Result<()> {
    let gateway = Gateway::new(&config).map_err(Error::Gateway)?;
    let app = app(gateway, &config);

    let listener = TcpListener::bind(listen_address).await.map_err(Error::Bind)?;

    log_endpoints(listen_address, &config);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(Error::Server)?;

    log::info!("Server stopped");

    Ok(())
}

/// The dialect routes behind the API key check, plus the unauthenticated health route.
fn app(gateway: Gateway, config: &Config) -> Router {
    let mut app = gateway::router(gateway.clone(), config);

    if config.server.requires_api_key() {
        app = app.layer(auth::ApiKeyLayer::new(config.server.api_key.clone()));
    }

    if config.server.health.enabled {
        let health = Router::new()
            .route(&config.server.health.path, get(health))
            .with_state(gateway);

        app = app.merge(health);
    }

    app
}

async fn health(State(gateway): State<Gateway>) -> Response {
    let report = gateway.health().await;

    let status = match report.status {
        HealthStatus::Ok => StatusCode::OK,
        _ => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status, Json(report)).into_response()
}

fn log_endpoints(listen_address: SocketAddr, config: &Config) {
    let protocols = &config.server.protocols;
    let base = |path: &str| format!("http://{listen_address}{}", path.trim_end_matches('/'));

    if protocols.openai.enabled {
        log::info!("OpenAI endpoint available at: {}/v1/chat/completions", base(&protocols.openai.path));
    }

    if protocols.anthropic.enabled {
        log::info!("Anthropic endpoint available at: {}/v1/messages", base(&protocols.anthropic.path));
    }

    if config.server.health.enabled {
        log::info!("Health endpoint available at: {}", base(&config.server.health.path));
    }
}
