//! HTTP API handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use std::sync::Arc;

use crate::server::stats::{totals, RelayTotals};
use crate::server::{ServerContext, SessionStats};

/// API response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// Relay status
#[derive(Debug, Serialize)]
pub struct RelayStatus {
    pub uptime_seconds: u64,
    pub connected_clients: u32,
    pub active_clients: u32,
    pub max_clients: usize,
    pub totals: RelayTotals,
}

pub async fn get_status(State(ctx): State<Arc<ServerContext>>) -> Json<ApiResponse<RelayStatus>> {
    let sessions = ctx.registry.stats();
    let counts = ctx.registry.counts();
    Json(ApiResponse::ok(RelayStatus {
        uptime_seconds: ctx.uptime().as_secs(),
        connected_clients: counts.connected_clients,
        active_clients: counts.active_clients,
        max_clients: ctx.registry.max_clients(),
        totals: totals(&ctx, &sessions),
    }))
}

pub async fn list_clients(
    State(ctx): State<Arc<ServerContext>>,
) -> Json<ApiResponse<Vec<SessionStats>>> {
    Json(ApiResponse::ok(ctx.registry.stats()))
}

pub async fn get_client(
    State(ctx): State<Arc<ServerContext>>,
    Path(id): Path<u32>,
) -> Result<Json<ApiResponse<SessionStats>>, (StatusCode, Json<ApiResponse<()>>)> {
    match ctx.registry.get(id) {
        Some(session) => Ok(Json(ApiResponse::ok(session.stats()))),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error(format!("client {} not found", id))),
        )),
    }
}
