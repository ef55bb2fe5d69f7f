use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Path, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Json, Response};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::json;
use skiff_protocol::room::{clamp_max_concurrent, generate_room_id, is_valid_room_id};
use skiff_protocol::RoomConfig;
use tracing::{error, info};

use crate::rate_limit::FixedWindowRateLimiter;
use crate::registry::RoomRegistry;
use crate::store::RoomStore;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<RoomRegistry>,
    pub store: RoomStore,
    pub limiter: Arc<FixedWindowRateLimiter>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateRoomRequest {
    #[serde(rename = "maxConcurrent")]
    pub max_concurrent: Option<f64>,
    #[serde(rename = "creatorCid")]
    pub creator_cid: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateRoomResponse {
    #[serde(rename = "roomId")]
    pub room_id: String,
}

#[derive(Debug, Serialize)]
pub struct RoomStatusResponse {
    #[serde(rename = "roomId")]
    pub room_id: String,
    #[serde(rename = "maxConcurrent")]
    pub max_concurrent: u8,
    pub exists: bool,
    #[serde(rename = "createdAt", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
}

/// Mint a room and persist its configuration before answering, so the
/// first upgrade always finds it.
pub async fn create_room(
    State(state): State<AppState>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    body: Option<Json<CreateRoomRequest>>,
) -> Result<Json<CreateRoomResponse>, StatusCode> {
    if !state.limiter.allow(&remote_addr.ip().to_string()) {
        counter!("skiff_pier_rooms_rate_limited_total").increment(1);
        return Err(StatusCode::TOO_MANY_REQUESTS);
    }

    let request = body.map(|Json(body)| body).unwrap_or_default();
    let config = RoomConfig {
        max_concurrent: clamp_max_concurrent(request.max_concurrent),
        creator_cid: request.creator_cid.filter(|cid| !cid.is_empty()),
    };

    let room_id = generate_room_id();
    if let Err(err) = state.store.save(&room_id, &config).await {
        error!(room = %room_id, "failed to persist room config: {err}");
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }

    counter!("skiff_pier_rooms_created_total").increment(1);
    info!(room = %room_id, max_concurrent = config.max_concurrent, "room created");
    Ok(Json(CreateRoomResponse { room_id }))
}

pub async fn room_status(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> Json<RoomStatusResponse> {
    let (config, created_at) = match state.store.load(&room_id).await {
        Some(record) => (record.config, Some(record.created_at)),
        None => (RoomConfig::default(), None),
    };
    Json(RoomStatusResponse {
        room_id,
        max_concurrent: config.max_concurrent,
        exists: created_at.is_some(),
        created_at,
    })
}

/// Minimal room shell. The real page is rendered by the web front-end;
/// this keeps the contract that the shell knows the concurrency
/// ceiling before any socket opens.
pub async fn room_page(State(state): State<AppState>, Path(room_id): Path<String>) -> Response {
    if !is_valid_room_id(&room_id) {
        return StatusCode::NOT_FOUND.into_response();
    }
    let config = state.store.load_config(&room_id).await.unwrap_or_default();
    Html(format!(
        "<!doctype html>\n<html>\n<head><meta charset=\"utf-8\"><title>skiff · {room_id}</title></head>\n\
         <body data-room-id=\"{room_id}\" data-max-concurrent=\"{}\">\n\
         <p>Room {room_id} — up to {} concurrent transfers.</p>\n\
         </body>\n</html>\n",
        config.max_concurrent, config.max_concurrent,
    ))
    .into_response()
}

pub async fn health_check() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn metrics_handler(State(handle): State<PrometheusHandle>) -> String {
    handle.render()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_state(rate_limit: u32) -> AppState {
        let store = RoomStore::in_memory();
        AppState {
            registry: RoomRegistry::new(store.clone()),
            store,
            limiter: Arc::new(FixedWindowRateLimiter::new(
                rate_limit,
                Duration::from_secs(60),
                1_000,
            )),
        }
    }

    fn addr(last_octet: u8) -> ConnectInfo<SocketAddr> {
        ConnectInfo(SocketAddr::from(([127, 0, 0, last_octet], 40_000)))
    }

    #[tokio::test]
    async fn create_room_clamps_and_persists_config() {
        let state = test_state(100);
        let response = create_room(
            State(state.clone()),
            addr(1),
            Some(Json(CreateRoomRequest {
                max_concurrent: Some(42.0),
                creator_cid: Some("me".into()),
            })),
        )
        .await
        .unwrap();

        let stored = state.store.load_config(&response.room_id).await.unwrap();
        assert_eq!(stored.max_concurrent, 10);
        assert_eq!(stored.creator_cid.as_deref(), Some("me"));
        assert!(is_valid_room_id(&response.room_id));
    }

    #[tokio::test]
    async fn create_room_defaults_without_body() {
        let state = test_state(100);
        let response = create_room(State(state.clone()), addr(1), None)
            .await
            .unwrap();
        let stored = state.store.load_config(&response.room_id).await.unwrap();
        assert_eq!(stored.max_concurrent, 3);
        assert_eq!(stored.creator_cid, None);
    }

    #[tokio::test]
    async fn create_room_rate_limits_per_source() {
        let state = test_state(4);
        let mut created = 0;
        let mut rejected = 0;
        for _ in 0..100 {
            match create_room(State(state.clone()), addr(1), None).await {
                Ok(_) => created += 1,
                Err(status) => {
                    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
                    rejected += 1;
                }
            }
        }
        assert_eq!(created, 4);
        assert_eq!(rejected, 96);

        // Another source still gets through.
        assert!(create_room(State(state.clone()), addr(2), None)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn unknown_room_status_reports_defaults() {
        let state = test_state(100);
        let Json(status) =
            room_status(State(state), Path("ZZZZZZZZZZ".to_string())).await;
        assert!(!status.exists);
        assert_eq!(status.max_concurrent, 3);
    }

    #[tokio::test]
    async fn room_page_rejects_malformed_ids() {
        let state = test_state(100);
        let response = room_page(State(state), Path("<script>".to_string())).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
