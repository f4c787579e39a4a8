pub mod conversations;
pub mod messages;

use actix_web::HttpRequest;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

/// Identity is resolved upstream; the gateway injects the authenticated
/// user id on every request it forwards.
pub fn caller_id(req: &HttpRequest) -> AppResult<Uuid> {
    header_uuid(req, "x-user-id")
}

/// Tenant resolved by the gateway alongside the user id.
pub fn caller_tenant(req: &HttpRequest) -> AppResult<Uuid> {
    header_uuid(req, "x-tenant-id")
}

fn header_uuid(req: &HttpRequest, name: &str) -> AppResult<Uuid> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or(AppError::Unauthorized)
}
