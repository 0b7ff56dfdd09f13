use axum::{extract::Request, http::HeaderMap, middleware::Next, response::Response};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::ledger::models::{Actor, Role};

pub const ACTOR_ID_HEADER: &str = "x-actor-id";
pub const ACTOR_ROLE_HEADER: &str = "x-actor-role";

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> AppResult<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::Unauthorized(format!("missing {} header", name)))
}

/// Read the caller identity set by the upstream session layer. It is trusted
/// as given; only its shape is checked here.
pub fn actor_from_headers(headers: &HeaderMap) -> AppResult<Actor> {
    let user_id = Uuid::parse_str(header_value(headers, ACTOR_ID_HEADER)?)
        .map_err(|_| AppError::Unauthorized(format!("malformed {} header", ACTOR_ID_HEADER)))?;
    let role = Role::parse(header_value(headers, ACTOR_ROLE_HEADER)?)
        .ok_or_else(|| AppError::Unauthorized(format!("unknown role in {}", ACTOR_ROLE_HEADER)))?;

    Ok(Actor::new(user_id, role))
}

/// Reject requests without an actor identity and hand the parsed `Actor` to
/// handlers through request extensions
pub async fn require_actor(mut req: Request, next: Next) -> AppResult<Response> {
    let actor = actor_from_headers(req.headers())?;
    req.extensions_mut().insert(actor);
    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(id: &str, role: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ACTOR_ID_HEADER, HeaderValue::from_str(id).unwrap());
        headers.insert(ACTOR_ROLE_HEADER, HeaderValue::from_str(role).unwrap());
        headers
    }

    #[test]
    fn test_actor_from_headers() {
        let id = Uuid::new_v4();
        let actor = actor_from_headers(&headers(&id.to_string(), "Admin")).unwrap();
        assert_eq!(actor, Actor::new(id, Role::Admin));
    }

    #[test]
    fn test_bad_identity_is_unauthorized() {
        assert!(matches!(
            actor_from_headers(&HeaderMap::new()),
            Err(AppError::Unauthorized(_))
        ));
        assert!(matches!(
            actor_from_headers(&headers("not-a-uuid", "staff")),
            Err(AppError::Unauthorized(_))
        ));
        assert!(matches!(
            actor_from_headers(&headers(&Uuid::new_v4().to_string(), "owner")),
            Err(AppError::Unauthorized(_))
        ));
    }
}
