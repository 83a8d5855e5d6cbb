use crate::{
    auth::IdentityVerifier,
    error::{ErrorCode, RelayError},
};
use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::{IntoResponse, Response},
};
use bookclub_common::types::UserIdentity;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub user_id: uuid::Uuid,
    pub display_name: String,
}

impl From<UserIdentity> for AuthenticatedUser {
    fn from(identity: UserIdentity) -> Self {
        Self { user_id: identity.user_id, display_name: identity.display_name }
    }
}

pub async fn require_bearer_auth(
    State(verifier): State<Arc<dyn IdentityVerifier>>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = match request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(extract_bearer_token)
    {
        Some(token) => token,
        None => return unauthorized_response("missing bearer token"),
    };

    let identity = match verifier.verify(token) {
        Ok(identity) => identity,
        Err(_) => return unauthorized_response("invalid bearer token"),
    };

    request.extensions_mut().insert(AuthenticatedUser::from(identity));

    next.run(request).await
}

fn extract_bearer_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.split_once(' ')?;

    if !scheme.eq_ignore_ascii_case("Bearer") {
        return None;
    }

    let token = token.trim();
    if token.is_empty() {
        return None;
    }

    Some(token)
}

fn unauthorized_response(message: &'static str) -> Response {
    RelayError::new(ErrorCode::AuthInvalidToken, message).into_response()
}
