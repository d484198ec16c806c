use axum::{
    extract::Extension,
    http::{Method, StatusCode},
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use sqlx::{Connection, PgPool};
use tracing::{error, info_span, Instrument};
use utoipa::ToSchema;

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct Health {
    name: String,
    version: String,
    database: String,
}

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Database is healthy", body = [Health]),
        (status = 503, description = "Database is unhealthy", body = [Health])
    ),
    tag = "health"
)]
pub async fn health(method: Method, pool: Extension<PgPool>) -> impl IntoResponse {
    let acquire_span = info_span!(
        "db.acquire",
        db.system = "postgresql",
        db.operation = "ACQUIRE"
    );
    let result = match pool.0.acquire().instrument(acquire_span).await {
        Ok(mut conn) => {
            let ping_span = info_span!("db.ping", db.system = "postgresql", db.operation = "PING");
            match conn.ping().instrument(ping_span).await {
                Ok(()) => Ok(()),
                Err(error) => {
                    error!("Failed to ping database: {}", error);
                    Err(StatusCode::SERVICE_UNAVAILABLE)
                }
            }
        }
        Err(error) => {
            error!("Failed to acquire database connection: {}", error);
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    };

    let health = Health {
        name: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        database: if result.is_ok() {
            "ok".to_string()
        } else {
            "error".to_string()
        },
    };

    let status = result.err().unwrap_or(StatusCode::OK);
    if method == Method::HEAD {
        status.into_response()
    } else {
        (status, Json(health)).into_response()
    }
}
