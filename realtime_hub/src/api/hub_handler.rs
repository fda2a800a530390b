//! 管理接口的请求处理器。

use super::ApiError;
use crate::state::HubState;
use axum::extract::State;
use axum::Json;
use common_models::auth::{TokenGrant, TokenRequest};
use common_models::management::{RoomsResponse, StatusResponse, TestBroadcastRequest, TestBroadcastResponse};
use log::{info, warn};
use std::sync::Arc;

/// GET /status
pub async fn status(State(state): State<Arc<HubState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        connections: state.connections.len(),
        active_connections: state.connections.active_len(),
        rooms: state.rooms.len(),
        uptime_seconds: state.uptime_seconds(),
        stats: state.stats.snapshot(),
    })
}

/// GET /rooms
pub async fn rooms(State(state): State<Arc<HubState>>) -> Json<RoomsResponse> {
    Json(state.rooms.room_counts())
}

/// POST /broadcast/test
pub async fn broadcast_test(
    State(state): State<Arc<HubState>>,
    Json(request): Json<TestBroadcastRequest>,
) -> Result<Json<TestBroadcastResponse>, ApiError> {
    let filter = request.filter.unwrap_or_default();
    let report = state
        .broadcaster
        .publish(&request.topic, &filter, request.payload)
        .map_err(|e| {
            warn!("[管理接口] 测试广播参数无效: {}", e);
            ApiError::bad_request(e.to_string())
        })?;
    info!(
        "[管理接口] 测试广播已发往 {}，送达 {} 个连接",
        report.room_key, report.delivered
    );
    Ok(Json(TestBroadcastResponse {
        room_key: report.room_key.to_string(),
        sequence: report.sequence,
        delivered: report.delivered,
    }))
}

/// POST /auth/token
pub async fn issue_token(
    State(state): State<Arc<HubState>>,
    Json(request): Json<TokenRequest>,
) -> Result<Json<TokenGrant>, ApiError> {
    state
        .signer
        .issue(request.user_id.as_deref(), &request.rooms, request.client_meta)
        .map(Json)
        .map_err(|e| {
            warn!("[管理接口] 拒绝签发令牌 (user_id={:?}): {}", request.user_id, e);
            ApiError::forbidden(e.to_string())
        })
}
