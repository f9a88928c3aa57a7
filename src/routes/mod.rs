pub mod relay;

use axum::{Router, middleware};
use std::sync::Arc;
use tower_http::set_header::SetResponseHeaderLayer;

use crate::middleware::connection_limit_middleware;
use crate::state::AppState;

/// Build the complete application: relay routes, connection limits and
/// security headers. Serve it with `into_make_service_with_connect_info`.
pub fn create_app_router(state: Arc<AppState>) -> Router {
    let security_headers = tower::ServiceBuilder::new()
        .layer(SetResponseHeaderLayer::overriding(
            http::header::X_CONTENT_TYPE_OPTIONS,
            http::HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            http::header::X_FRAME_OPTIONS,
            http::HeaderValue::from_static("DENY"),
        ));

    relay::create_relay_router(&state.config.relay_path)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            connection_limit_middleware,
        ))
        .with_state(state)
        .layer(security_headers)
}
