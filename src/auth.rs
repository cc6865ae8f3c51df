use axum::http::HeaderMap;
use ulid::Ulid;

use crate::engine::EngineError;
use crate::model::{Actor, Role};

/// Set by the upstream authentication gateway.
pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";

fn parse_role(value: &str) -> Option<Role> {
    match value.trim().to_ascii_uppercase().as_str() {
        "TRAINER" => Some(Role::Trainer),
        "CLIENT" => Some(Role::Client),
        _ => None,
    }
}

/// Identity carried by the request, if both headers are present and well formed.
pub fn actor_from_headers(headers: &HeaderMap) -> Option<Actor> {
    let user_id = headers.get(USER_ID_HEADER)?.to_str().ok()?;
    let role = headers.get(USER_ROLE_HEADER)?.to_str().ok()?;
    Some(Actor {
        user_id: Ulid::from_string(user_id.trim()).ok()?,
        role: parse_role(role)?,
    })
}

pub fn require_actor(headers: &HeaderMap) -> Result<Actor, EngineError> {
    actor_from_headers(headers)
        .ok_or_else(|| EngineError::Unauthorized("missing or invalid identity headers".into()))
}
