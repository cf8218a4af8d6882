//! HTTP handlers for the routing API.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use routemux_core::{Route, RouterGroup, RoutingError, TcpRouteMapping};
use serde::Serialize;
use tracing::debug;

use crate::error::ApiError;

use super::AppState;

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Health check endpoint
pub async fn health() -> Json<HealthResponse> {
    debug!("[Gateway] Health check");
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

pub async fn list_routes(State(state): State<AppState>) -> Result<Json<Vec<Route>>, ApiError> {
    let routes = state.store.read_routes().await?;
    Ok(Json(routes))
}

/// Upsert a batch of HTTP routes. Entries apply in order; the first
/// failure aborts the rest of the batch and already-committed entries
/// stay committed.
pub async fn upsert_routes(
    State(state): State<AppState>,
    Json(routes): Json<Vec<Route>>,
) -> Result<StatusCode, ApiError> {
    debug!("[Gateway] Upserting {} routes", routes.len());
    for route in routes {
        state.store.upsert_route(route).await?;
    }
    Ok(StatusCode::OK)
}

pub async fn delete_routes(
    State(state): State<AppState>,
    Json(routes): Json<Vec<Route>>,
) -> Result<StatusCode, ApiError> {
    debug!("[Gateway] Deleting {} routes", routes.len());
    let store = &state.store;
    delete_batch(routes, |route| async move { store.delete_route(&route).await }).await
}

pub async fn list_tcp_routes(
    State(state): State<AppState>,
) -> Result<Json<Vec<TcpRouteMapping>>, ApiError> {
    let mappings = state.store.read_tcp_routes().await?;
    Ok(Json(mappings))
}

pub async fn upsert_tcp_routes(
    State(state): State<AppState>,
    Json(mappings): Json<Vec<TcpRouteMapping>>,
) -> Result<StatusCode, ApiError> {
    debug!("[Gateway] Upserting {} tcp route mappings", mappings.len());
    for mapping in mappings {
        state.store.upsert_tcp_route(mapping).await?;
    }
    Ok(StatusCode::OK)
}

pub async fn delete_tcp_routes(
    State(state): State<AppState>,
    Json(mappings): Json<Vec<TcpRouteMapping>>,
) -> Result<StatusCode, ApiError> {
    debug!("[Gateway] Deleting {} tcp route mappings", mappings.len());
    let store = &state.store;
    delete_batch(mappings, |mapping| async move {
        store.delete_tcp_route(&mapping).await
    })
    .await
}

pub async fn list_router_groups(
    State(state): State<AppState>,
) -> Result<Json<Vec<RouterGroup>>, ApiError> {
    let groups = state.store.read_router_groups().await?;
    Ok(Json(groups))
}

pub async fn update_router_group(
    State(state): State<AppState>,
    Path(guid): Path<String>,
    Json(mut group): Json<RouterGroup>,
) -> Result<Json<RouterGroup>, ApiError> {
    group.guid = guid.clone();
    state.store.save_router_group(group).await?;

    let saved = state
        .store
        .read_router_group(&guid)
        .await?
        .ok_or_else(|| RoutingError::backend("router group vanished after save"))?;
    Ok(Json(saved))
}

/// Batch delete: 204 when anything matched, 404 (first miss) when nothing
/// did. Matched entries are removed either way.
async fn delete_batch<T, F, Fut>(items: Vec<T>, mut delete_one: F) -> Result<StatusCode, ApiError>
where
    F: FnMut(T) -> Fut,
    Fut: std::future::Future<Output = Result<(), RoutingError>>,
{
    let mut matched = false;
    let mut first_miss: Option<RoutingError> = None;

    for item in items {
        match delete_one(item).await {
            Ok(()) => matched = true,
            Err(err @ RoutingError::NotFound(_)) => {
                first_miss.get_or_insert(err);
            }
            Err(err) => return Err(err.into()),
        }
    }

    match (matched, first_miss) {
        (false, Some(err)) => Err(err.into()),
        _ => Ok(StatusCode::NO_CONTENT),
    }
}
