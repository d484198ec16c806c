use crate::{
    api::handlers::{auth, health},
    session::{
        audit::TracingAuditSink, AuthConfig, Orchestrator, PgCredentialStore, TokenIssuer,
        TotpRsEngine,
    },
};
use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::MatchedPath,
    http::Request,
    routing::{get, post},
    Extension, Router,
};
use sqlx::postgres::PgPoolOptions;
use std::{sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::{info, info_span, warn, Span};

pub(crate) mod handlers;

const ENV_ACCESS_TOKEN_KEY: &str = "SIGILO_ACCESS_TOKEN_KEY";

/// Build the API router. State is attached by [`new`].
#[must_use]
pub fn router() -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/v1/auth/login", post(auth::login))
        .route("/v1/auth/refresh", post(auth::refresh))
        .route("/v1/auth/logout", post(auth::logout))
        .route("/v1/auth/mfa/setup", post(auth::mfa::setup))
        .route("/v1/auth/mfa/verify-setup", post(auth::mfa::verify_setup))
        .route("/v1/auth/mfa/verify", post(auth::mfa::verify))
        .route("/v1/auth/mfa/disable", post(auth::mfa::disable))
        .route("/v1/auth/mfa/status", get(auth::mfa::status))
        .route(
            "/v1/auth/mfa/regenerate-backup-codes",
            post(auth::mfa::regenerate_backup_codes),
        )
}

/// Start the server
/// # Errors
/// Return error if failed to start the server
pub async fn new(port: u16, dsn: String) -> Result<()> {
    // Connect to database
    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(5)
        .max_lifetime(Duration::from_secs(60 * 2))
        .test_before_acquire(true)
        .connect(&dsn)
        .await
        .context("Failed to connect to database")?;

    let config = AuthConfig::from_env();
    let issuer = token_issuer(&config)?;
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::new(PgCredentialStore::new(pool.clone())),
        Arc::new(TotpRsEngine),
        issuer,
        Arc::new(TracingAuditSink),
        config,
    ));

    let app = router()
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http().make_span_with(make_span))
        .layer(Extension(orchestrator))
        .layer(Extension(pool));

    let listener = TcpListener::bind(format!("::0:{port}")).await?;

    info!("Listening on [::]:{}", port);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Gracefully shutdown");
            }
        })
        .await?;

    Ok(())
}

/// Build the token issuer from `SIGILO_ACCESS_TOKEN_KEY`, or fall back to an
/// ephemeral keypair. With an ephemeral key every restart invalidates all
/// outstanding access tokens, so production deployments set the key.
fn token_issuer(config: &AuthConfig) -> Result<TokenIssuer> {
    if let Ok(key) = std::env::var(ENV_ACCESS_TOKEN_KEY) {
        return TokenIssuer::from_key_base64(&key, config.token_issuer(), config.token_audience())
            .context("Invalid SIGILO_ACCESS_TOKEN_KEY");
    }
    warn!("SIGILO_ACCESS_TOKEN_KEY not set, using an ephemeral signing key");
    TokenIssuer::generate(config.token_issuer(), config.token_audience())
        .context("Failed to generate signing keypair")
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}
