//! REST surface for multiparty sessions (join/leave/message/info) and
//! stream administration.

use crate::error::AppError;
use crate::relay::protocol::ServerMessage;
use crate::relay::room::Participant;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;

pub async fn list_sessions(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let sessions = state.services.multiparty.all_sessions();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "total": sessions.len(),
        "sessions": sessions
    })))
}

pub async fn session_info(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let session_id = path.into_inner();
    let info = state
        .services
        .multiparty
        .session_info(&session_id)
        .ok_or_else(|| {
            AppError::NotFound(format!("multiparty session '{}' not found", session_id))
        })?;

    Ok(HttpResponse::Ok().json(info))
}

#[derive(Debug, Deserialize)]
pub struct JoinSessionBody {
    pub user_id: String,
    pub user_name: Option<String>,
    pub language: Option<String>,
    pub listen_language: Option<String>,
}

/// Join a capacity-bounded multiparty session; 409 when it is full.
pub async fn join_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<JoinSessionBody>,
) -> Result<HttpResponse, AppError> {
    let session_id = path.into_inner();
    let body = body.into_inner();

    let language = body.language.unwrap_or_else(|| "en".to_string());
    let participant = Participant {
        id: body.user_id.clone(),
        name: body.user_name.unwrap_or(body.user_id),
        listen_language: body.listen_language.unwrap_or_else(|| language.clone()),
        language,
        joined_at: chrono::Utc::now(),
    };

    let info = state.services.multiparty.join(&session_id, participant)?;
    Ok(HttpResponse::Ok().json(info))
}

#[derive(Debug, Deserialize)]
pub struct UserQuery {
    pub user_id: String,
}

pub async fn leave_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<UserQuery>,
) -> Result<HttpResponse, AppError> {
    let session_id = path.into_inner();
    let user_id = query.into_inner().user_id;

    let left = state.services.multiparty.leave(&user_id);
    if left.as_deref() != Some(session_id.as_str()) {
        return Err(AppError::NotFound(format!(
            "'{}' is not in session '{}'",
            user_id, session_id
        )));
    }

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "session_id": session_id,
        "user_id": user_id
    })))
}

#[derive(Debug, Deserialize)]
pub struct SessionMessageBody {
    pub speaker_id: String,
    pub content: String,
    pub message_type: Option<String>,
}

/// Append to the session history and relay to the other members over their
/// live connections.
pub async fn post_session_message(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<SessionMessageBody>,
) -> Result<HttpResponse, AppError> {
    let session_id = path.into_inner();
    let body = body.into_inner();
    let message_type = body.message_type.unwrap_or_else(|| "text".to_string());

    let notice = ServerMessage::RoomMessage {
        room_code: session_id.clone(),
        content: body.content.clone(),
        original_text: body.content.clone(),
        original_language: String::new(),
        target_language: String::new(),
        translated: false,
        speaker_name: body.speaker_id.clone(),
        emotion: None,
        audio_url: None,
        timestamp: chrono::Utc::now().to_rfc3339(),
    };

    let report = state.services.multiparty.process_message(
        &state.services.registry,
        &session_id,
        &body.speaker_id,
        &body.content,
        &message_type,
        &notice,
    )?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "session_id": session_id,
        "participants_notified": report.participants_notified,
        "evicted": report.evicted
    })))
}

pub async fn list_streams(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let streams = state.services.sessions.overviews();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "total": streams.len(),
        "streams": streams
    })))
}

/// Administrative end of a stream session. Ending an unknown session is a
/// no-op, matching the WebSocket end_stream semantics.
pub async fn end_stream(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let session_id = path.into_inner();
    let ended = state.services.sessions.end_session(&session_id);

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "session_id": session_id,
        "ended": ended
    })))
}
