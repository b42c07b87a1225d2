//! Producer HTTP surface.
//!
//! Producers target sessions, users, rooms, or everyone; the raw request body
//! is the final payload and passes through unchanged.

use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/goim/push/keys", post(push_keys))
        .route("/goim/push/mids", post(push_mids))
        .route("/goim/push/room", post(push_room))
        .route("/goim/push/all", post(push_all))
        .route("/goim/online/total", get(online_total))
}

type Params = Vec<(String, String)>;

fn values<'a>(params: &'a Params, name: &'a str) -> impl Iterator<Item = &'a str> {
    params
        .iter()
        .filter(move |(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}

fn required<'a>(params: &'a Params, name: &'a str) -> Result<&'a str, ApiError> {
    values(params, name)
        .next()
        .ok_or_else(|| ApiError::bad_request(format!("{name} is required")))
}

fn required_i32(params: &Params, name: &str) -> Result<i32, ApiError> {
    required(params, name)?
        .parse()
        .map_err(|_| ApiError::bad_request(format!("{name} must be an integer")))
}

async fn push_keys(
    State(state): State<AppState>,
    Query(params): Query<Params>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let operation = required_i32(&params, "operation")?;
    let keys: Vec<String> = values(&params, "keys").map(str::to_string).collect();
    if keys.is_empty() {
        return Err(ApiError::bad_request("keys is required"));
    }
    state.logic.push_keys(operation, &keys, body.to_vec()).await?;
    Ok(Json(json!({ "code": 0 })))
}

async fn push_mids(
    State(state): State<AppState>,
    Query(params): Query<Params>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let operation = required_i32(&params, "operation")?;
    let mids: Vec<i64> = values(&params, "mids")
        .map(|v| {
            v.parse()
                .map_err(|_| ApiError::bad_request("mids must be integers"))
        })
        .collect::<Result<_, _>>()?;
    if mids.is_empty() {
        return Err(ApiError::bad_request("mids is required"));
    }
    state.logic.push_mids(operation, &mids, body.to_vec()).await?;
    Ok(Json(json!({ "code": 0 })))
}

async fn push_room(
    State(state): State<AppState>,
    Query(params): Query<Params>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let operation = required_i32(&params, "operation")?;
    let typ = required(&params, "type")?.to_string();
    let room = required(&params, "room")?.to_string();
    state
        .logic
        .push_room(operation, &typ, &room, body.to_vec())
        .await?;
    Ok(Json(json!({ "code": 0 })))
}

async fn push_all(
    State(state): State<AppState>,
    Query(params): Query<Params>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let operation = required_i32(&params, "operation")?;
    let speed = values(&params, "speed")
        .next()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    state.logic.push_all(operation, speed, body.to_vec()).await?;
    Ok(Json(json!({ "code": 0 })))
}

async fn online_total(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let total = state.logic.online_total().await?;
    Ok(Json(json!({ "code": 0, "data": total })))
}
