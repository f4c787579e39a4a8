use actix_web::{delete, get, post, put, web, HttpRequest, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::error::AppResult;
use crate::models::{ContextRef, ConversationType, ParticipantRole};
use crate::routes::{caller_id, caller_tenant};
use crate::services::conversation_service::ConversationOptions;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateConversationRequest {
    pub topic: String,
    pub conversation_type: Option<ConversationType>,
    pub context: Option<ContextRef>,
    #[serde(default)]
    pub confidential: bool,
    pub retention_days: Option<i64>,
    pub auto_close_days: Option<i64>,
    pub max_participants: Option<usize>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct AddParticipantRequest {
    pub user_id: Uuid,
    pub role: Option<ParticipantRole>,
}

#[derive(Debug, Deserialize)]
pub struct MuteRequest {
    pub muted: bool,
}

#[derive(Debug, Deserialize)]
pub struct MarkReadRequest {
    pub up_to_seq: i64,
}

#[post("/conversations")]
pub async fn create_conversation(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<CreateConversationRequest>,
) -> AppResult<HttpResponse> {
    let caller = caller_id(&req)?;
    let tenant = caller_tenant(&req)?;
    let body = body.into_inner();
    let conversation = state
        .service
        .create_conversation(
            caller,
            tenant,
            body.conversation_type.unwrap_or(ConversationType::Group),
            body.context,
            body.topic,
            ConversationOptions {
                confidential: body.confidential,
                retention_days: body.retention_days,
                auto_close_days: body.auto_close_days,
                max_participants: body.max_participants,
                metadata: body.metadata,
            },
        )
        .await?;
    Ok(HttpResponse::Created().json(conversation))
}

#[get("/conversations")]
pub async fn list_conversations(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> AppResult<HttpResponse> {
    let caller = caller_id(&req)?;
    let summaries = state.service.list_conversations(caller).await?;
    Ok(HttpResponse::Ok().json(summaries))
}

#[get("/conversations/{id}")]
pub async fn get_conversation(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> AppResult<HttpResponse> {
    let caller = caller_id(&req)?;
    let (conversation, participants) = state
        .service
        .get_conversation(caller, path.into_inner())
        .await?;
    Ok(HttpResponse::Ok().json(json!({
        "conversation": conversation,
        "participants": participants,
    })))
}

#[post("/conversations/{id}/participants")]
pub async fn add_participant(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    body: web::Json<AddParticipantRequest>,
) -> AppResult<HttpResponse> {
    let caller = caller_id(&req)?;
    let body = body.into_inner();
    state
        .service
        .add_participant(
            caller,
            path.into_inner(),
            body.user_id,
            body.role.unwrap_or(ParticipantRole::Member),
        )
        .await?;
    Ok(HttpResponse::NoContent().finish())
}

#[put("/conversations/{id}/participants/{user_id}/mute")]
pub async fn mute_participant(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<(Uuid, Uuid)>,
    body: web::Json<MuteRequest>,
) -> AppResult<HttpResponse> {
    let caller = caller_id(&req)?;
    let (conversation_id, user_id) = path.into_inner();
    state
        .service
        .set_participant_muted(caller, conversation_id, user_id, body.muted)
        .await?;
    Ok(HttpResponse::NoContent().finish())
}

#[put("/conversations/{id}/mute")]
pub async fn mute_conversation(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    body: web::Json<MuteRequest>,
) -> AppResult<HttpResponse> {
    let caller = caller_id(&req)?;
    state
        .service
        .set_system_muted(caller, path.into_inner(), body.muted)
        .await?;
    Ok(HttpResponse::NoContent().finish())
}

#[delete("/conversations/{id}/participants/{user_id}")]
pub async fn remove_participant(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<(Uuid, Uuid)>,
) -> AppResult<HttpResponse> {
    let caller = caller_id(&req)?;
    let (conversation_id, user_id) = path.into_inner();
    state
        .service
        .remove_participant(caller, conversation_id, user_id)
        .await?;
    Ok(HttpResponse::NoContent().finish())
}

#[post("/conversations/{id}/close")]
pub async fn close_conversation(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> AppResult<HttpResponse> {
    let caller = caller_id(&req)?;
    state
        .service
        .close_conversation(caller, path.into_inner())
        .await?;
    Ok(HttpResponse::NoContent().finish())
}

#[post("/conversations/{id}/archive")]
pub async fn archive_conversation(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> AppResult<HttpResponse> {
    let caller = caller_id(&req)?;
    state
        .service
        .archive_conversation(caller, path.into_inner())
        .await?;
    Ok(HttpResponse::NoContent().finish())
}

#[post("/conversations/{id}/read")]
pub async fn mark_read(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    body: web::Json<MarkReadRequest>,
) -> AppResult<HttpResponse> {
    let caller = caller_id(&req)?;
    state
        .service
        .mark_read(caller, path.into_inner(), body.up_to_seq)
        .await?;
    Ok(HttpResponse::NoContent().finish())
}

#[post("/conversations/{id}/typing")]
pub async fn typing(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> AppResult<HttpResponse> {
    let caller = caller_id(&req)?;
    state.service.typing(caller, path.into_inner()).await?;
    Ok(HttpResponse::NoContent().finish())
}
