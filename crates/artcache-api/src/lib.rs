//! # artcache-api: HTTP Front End for the Build Artifact Cache
//!
//! Buck-compatible HTTP cache over [`artcache_core`].
//!
//! ## API Surface
//!
//! | Prefix          | Module                 | Auth |
//! |-----------------|------------------------|------|
//! | `/artifacts/*`  | [`routes::artifacts`]  | yes  |
//! | `/health`       | [`routes::health`]     | no   |
//! | `/metrics`      | [`routes::health`]     | no   |
//!
//! ## Middleware Stack (execution order)
//!
//! ```text
//! TraceLayer → BodyLimit → MetricsMiddleware → AuthMiddleware → Handler
//! ```

pub mod auth;
pub mod error;
pub mod middleware;
pub mod routes;
pub mod state;

use axum::extract::DefaultBodyLimit;
use axum::middleware::from_fn;
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::auth::AuthConfig;
use crate::state::AppState;

/// Assemble the application router with all routes and middleware.
///
/// `/health` and `/metrics` are mounted outside the auth middleware so
/// probes and scrapers need no credentials.
pub fn app(state: AppState) -> Router {
    let auth_config = AuthConfig::new(state.config.auth_tokens.iter().cloned());
    let body_limit = state.config.max_artifact_bytes;
    let metrics = state.metrics.clone();

    let api = Router::new()
        .merge(routes::artifacts::router())
        .layer(from_fn(auth::auth_middleware))
        .layer(axum::Extension(auth_config))
        .with_state(state.clone());

    let probes = routes::health::router().with_state(state);

    Router::new()
        .merge(probes)
        .merge(api)
        .layer(from_fn(middleware::metrics::metrics_middleware))
        .layer(axum::Extension(metrics))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
}
