//! REST surface for room inspection and administrative leave.

use crate::error::AppError;
use crate::relay::protocol::ServerMessage;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;

pub async fn list_rooms(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let rooms = state.services.rooms.active_rooms();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "total": rooms.len(),
        "rooms": rooms
    })))
}

pub async fn room_users(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let room_code = path.into_inner();
    let users = state
        .services
        .rooms
        .members(&room_code)
        .ok_or_else(|| AppError::NotFound(format!("room '{}' not found", room_code)))?;

    Ok(HttpResponse::Ok().json(json!({
        "room_code": room_code,
        "count": users.len(),
        "users": users
    })))
}

#[derive(Debug, Deserialize)]
pub struct LeaveQuery {
    pub user_id: String,
}

/// Administrative removal of a participant from a room. The remaining
/// members get the same `user_left` notice as an ordinary leave.
pub async fn leave_room(
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<LeaveQuery>,
) -> Result<HttpResponse, AppError> {
    let room_code = path.into_inner();
    let user_id = query.into_inner().user_id;

    if !state.services.rooms.leave_room(&user_id, &room_code) {
        return Err(AppError::NotFound(format!(
            "'{}' is not a member of room '{}'",
            user_id, room_code
        )));
    }

    state.services.rooms.broadcast(
        &state.services.registry,
        &room_code,
        &ServerMessage::UserLeft {
            room_code: room_code.clone(),
            user_id: user_id.clone(),
        },
        None,
    );

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "room_code": room_code,
        "user_id": user_id
    })))
}
