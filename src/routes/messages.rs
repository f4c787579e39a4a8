use actix_web::{delete, get, patch, post, web, HttpRequest, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::error::AppResult;
use crate::routes::caller_id;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub body: String,
}

#[derive(Debug, Deserialize)]
pub struct EditMessageRequest {
    pub body: String,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub since_seq: i64,
    pub limit: Option<i64>,
}

#[post("/conversations/{id}/messages")]
pub async fn send_message(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    body: web::Json<SendMessageRequest>,
) -> AppResult<HttpResponse> {
    let caller = caller_id(&req)?;
    let message = state
        .service
        .send_message(caller, path.into_inner(), &body.body)
        .await?;
    Ok(HttpResponse::Created().json(json!({
        "message_id": message.id,
        "sequence_number": message.sequence_number,
        "created_at": message.created_at,
    })))
}

#[get("/conversations/{id}/messages")]
pub async fn get_messages(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    query: web::Query<HistoryQuery>,
) -> AppResult<HttpResponse> {
    let caller = caller_id(&req)?;
    let messages = state
        .service
        .get_messages(
            caller,
            path.into_inner(),
            query.since_seq,
            query.limit.unwrap_or(100),
        )
        .await?;
    Ok(HttpResponse::Ok().json(messages))
}

#[patch("/conversations/{id}/messages/{message_id}")]
pub async fn edit_message(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<(Uuid, Uuid)>,
    body: web::Json<EditMessageRequest>,
) -> AppResult<HttpResponse> {
    let caller = caller_id(&req)?;
    let (conversation_id, message_id) = path.into_inner();
    state
        .service
        .edit_message(caller, conversation_id, message_id, &body.body)
        .await?;
    Ok(HttpResponse::NoContent().finish())
}

#[delete("/conversations/{id}/messages/{message_id}")]
pub async fn delete_message(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<(Uuid, Uuid)>,
) -> AppResult<HttpResponse> {
    let caller = caller_id(&req)?;
    let (conversation_id, message_id) = path.into_inner();
    state
        .service
        .delete_message(caller, conversation_id, message_id)
        .await?;
    Ok(HttpResponse::NoContent().finish())
}
