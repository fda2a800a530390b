//! 管理 HTTP 接口模块。
//!
//! 面向运维人员与测试的少量接口，与 WebSocket 服务共享同一个 [`HubState`]：
//! - `GET /status`: 连接数、房间数、运行时长与累计统计；
//! - `GET /rooms`: 房间键 → 成员数；
//! - `POST /broadcast/test`: 向指定主题/过滤器注入一条测试事件；
//! - `POST /auth/token`: 签发握手令牌。

pub mod hub_handler;

use crate::state::HubState;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use common_models::management::ApiErrorBody;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

/// 创建管理接口路由。
pub fn create_router(state: Arc<HubState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/status", get(hub_handler::status))
        .route("/rooms", get(hub_handler::rooms))
        .route("/broadcast/test", post(hub_handler::broadcast_test))
        .route("/auth/token", post(hub_handler::issue_token))
        .layer(cors)
        .with_state(state)
}

/// 管理接口的错误，统一转换为 `{ "error": "..." }` 响应体。
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ApiErrorBody { error: self.message })).into_response()
    }
}
