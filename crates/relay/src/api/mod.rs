// HTTP surface next to the socket: section activity ingress from the REST
// side of the platform and a presence query for room headers.

use std::sync::Arc;

use axum::{
    extract::{Extension, Json, Path, State},
    http::StatusCode,
    middleware,
    routing::{get, post},
    Router,
};
use bookclub_common::types::UserIdentity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::{
    auth::{
        middleware::{require_bearer_auth, AuthenticatedUser},
        IdentityVerifier,
    },
    error::{ErrorCode, RelayError},
    reconnect::LinkState,
    rooms::RoomHub,
};

#[derive(Clone)]
struct ApiState {
    hub: RoomHub,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionActivityRequest {
    /// Club members to mark even when they have no live session.
    #[serde(default)]
    pub member_user_ids: Vec<Uuid>,
    #[serde(default)]
    pub occurred_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionActivityResponse {
    pub notified: usize,
}

/// Whether a present user is live or held by a reconnect grace window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PresenceLink {
    Connected,
    Reconnecting,
}

impl From<LinkState> for PresenceLink {
    fn from(state: LinkState) -> Self {
        match state {
            LinkState::Connecting { .. } => Self::Reconnecting,
            LinkState::Connected | LinkState::Disconnected => Self::Connected,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    #[serde(flatten)]
    pub user: UserIdentity,
    pub link: PresenceLink,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceResponse {
    pub room_id: Uuid,
    pub users: Vec<PresenceEntry>,
}

pub fn router(hub: RoomHub, verifier: Arc<dyn IdentityVerifier>) -> Router {
    let auth_layer = middleware::from_fn_with_state(verifier, require_bearer_auth);

    Router::new()
        .route("/v1/clubs/{club_id}/sections/{section}/activity", post(report_section_activity))
        .route("/v1/rooms/{room_id}/presence", get(room_presence))
        .route_layer(auth_layer)
        .with_state(ApiState { hub })
}

async fn report_section_activity(
    State(state): State<ApiState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path((club_id, section)): Path<(Uuid, String)>,
    Json(payload): Json<SectionActivityRequest>,
) -> Result<(StatusCode, Json<SectionActivityResponse>), RelayError> {
    let at = payload.occurred_at.unwrap_or_else(Utc::now);
    let notified = state
        .hub
        .notify_section_activity(club_id, &section, Some(user.user_id), &payload.member_user_ids, at)
        .await?;
    debug!(club_id = %club_id, section = %section, notified, "section activity recorded");

    Ok((StatusCode::ACCEPTED, Json(SectionActivityResponse { notified })))
}

async fn room_presence(
    State(state): State<ApiState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(room_id): Path<Uuid>,
) -> Result<Json<PresenceResponse>, RelayError> {
    if !state.hub.authorizer().can_join_room(user.user_id, room_id).await {
        return Err(RelayError::new(ErrorCode::AuthForbidden, "caller cannot see this room"));
    }
    let reconnect = state.hub.reconnect();
    let users = state
        .hub
        .presence(room_id)
        .await
        .into_iter()
        .map(|user| PresenceEntry { link: reconnect.link_state(user.user_id).into(), user })
        .collect();
    Ok(Json(PresenceResponse { room_id, users }))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        http::{header::AUTHORIZATION, Method, Request, StatusCode},
        Router,
    };
    use bookclub_common::{
        link::CloseKind,
        types::{RoomInfo, RoomKind, UserIdentity},
    };
    use serde_json::Value;
    use tower::ServiceExt;
    use uuid::Uuid;

    use super::router;
    use crate::{
        auth::jwt::JwtIdentityVerifier,
        collab::{MemberListAuthorizer, MemoryRoomStore},
        rooms::{HubSettings, RoomHub},
    };

    const TEST_SECRET: &str = "bookclub_test_secret_that_is_definitely_long_enough";

    fn club() -> Uuid {
        Uuid::from_u128(100)
    }

    fn identity(n: u128) -> UserIdentity {
        UserIdentity {
            user_id: Uuid::from_u128(n),
            display_name: format!("reader-{n}"),
            avatar_ref: None,
        }
    }

    fn test_router() -> (Router, RoomHub, Arc<JwtIdentityVerifier>) {
        let store = Arc::new(MemoryRoomStore::with_rooms([
            RoomInfo {
                room_id: Uuid::from_u128(1_001),
                club_id: club(),
                kind: RoomKind::Chat,
                member_user_ids: Vec::new(),
            },
            RoomInfo {
                room_id: Uuid::from_u128(1_002),
                club_id: club(),
                kind: RoomKind::Chat,
                member_user_ids: vec![Uuid::from_u128(2)],
            },
        ]));
        let authorizer = Arc::new(MemberListAuthorizer::new(store.clone()));
        let hub = RoomHub::new(store, authorizer, HubSettings::default());
        let verifier =
            Arc::new(JwtIdentityVerifier::new(TEST_SECRET).expect("verifier should initialize"));
        (router(hub.clone(), verifier.clone()), hub, verifier)
    }

    fn bearer(verifier: &JwtIdentityVerifier, user: u128) -> String {
        format!("Bearer {}", verifier.issue_token(&identity(user)).expect("token should issue"))
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("response body should be readable");
        serde_json::from_slice(&bytes).expect("response body should be valid json")
    }

    #[tokio::test]
    async fn routes_require_bearer_auth() {
        let (router, _, _) = test_router();
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/v1/rooms/00000000-0000-0000-0000-0000000003e9/presence")
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("request should return response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn section_activity_marks_connected_club_members() {
        let (router, hub, verifier) = test_router();
        let (reader, mut outbound) = hub.open_session(identity(2));
        let reader_id = reader.session_id;
        hub.connect(reader).await;
        hub.join(reader_id, club(), Uuid::from_u128(1_001)).await.expect("join should succeed");

        let response = router
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri(format!("/v1/clubs/{}/sections/suggestions/activity", club()))
                    .header("content-type", "application/json")
                    .header(AUTHORIZATION, bearer(&verifier, 1))
                    .body(Body::from(format!(
                        "{{\"memberUserIds\":[\"{}\"]}}",
                        Uuid::from_u128(3)
                    )))
                    .expect("request should build"),
            )
            .await
            .expect("request should return response");

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(body_json(response).await["notified"], 2);

        let mut saw_activity = false;
        while let Ok(frame) = outbound.try_recv() {
            if frame.kind() == "section-activity" {
                saw_activity = true;
            }
        }
        assert!(saw_activity, "live session should receive the activity hint");
        let summary = hub.unread_summary(Uuid::from_u128(3), club()).await;
        assert_eq!(summary.sections, vec!["suggestions".to_string()]);
    }

    #[tokio::test]
    async fn section_activity_requires_club_membership() {
        let (router, hub, verifier) = test_router();
        let (reader, mut outbound) = hub.open_session(identity(2));
        let reader_id = reader.session_id;
        hub.connect(reader).await;
        hub.join(reader_id, club(), Uuid::from_u128(1_001)).await.expect("join should succeed");
        let foreign_club = Uuid::from_u128(200);

        let response = router
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri(format!("/v1/clubs/{foreign_club}/sections/suggestions/activity"))
                    .header("content-type", "application/json")
                    .header(AUTHORIZATION, bearer(&verifier, 1))
                    .body(Body::from(format!(
                        "{{\"memberUserIds\":[\"{}\"]}}",
                        Uuid::from_u128(2)
                    )))
                    .expect("request should build"),
            )
            .await
            .expect("request should return response");

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(body_json(response).await["error"]["code"], "AUTH_FORBIDDEN");
        assert!(outbound.try_recv().is_err());
        let summary = hub.unread_summary(Uuid::from_u128(2), foreign_club).await;
        assert!(summary.sections.is_empty());
    }

    #[tokio::test]
    async fn section_activity_rejects_invalid_section() {
        let (router, _, verifier) = test_router();
        let long_section = "s".repeat(65);
        let response = router
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri(format!("/v1/clubs/{}/sections/{long_section}/activity", club()))
                    .header("content-type", "application/json")
                    .header(AUTHORIZATION, bearer(&verifier, 1))
                    .body(Body::from("{}"))
                    .expect("request should build"),
            )
            .await
            .expect("request should return response");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"]["code"], "VALIDATION_FAILED");
    }

    #[tokio::test]
    async fn presence_lists_users_for_authorized_callers() {
        let (router, hub, verifier) = test_router();
        let (reader, _outbound) = hub.open_session(identity(2));
        let reader_id = reader.session_id;
        hub.connect(reader).await;
        hub.join(reader_id, club(), Uuid::from_u128(1_002)).await.expect("join should succeed");

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/v1/rooms/{}/presence", Uuid::from_u128(1_002)))
                    .header(AUTHORIZATION, bearer(&verifier, 2))
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("request should return response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["users"][0]["userId"], Uuid::from_u128(2).to_string());

        let forbidden = router
            .oneshot(
                Request::builder()
                    .uri(format!("/v1/rooms/{}/presence", Uuid::from_u128(1_002)))
                    .header(AUTHORIZATION, bearer(&verifier, 1))
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("request should return response");
        assert_eq!(forbidden.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn presence_marks_users_held_for_reconnect() {
        let (router, hub, verifier) = test_router();
        let (reader, _outbound) = hub.open_session(identity(2));
        let reader_id = reader.session_id;
        hub.connect(reader).await;
        hub.join(reader_id, club(), Uuid::from_u128(1_001)).await.expect("join should succeed");
        let (watcher, _watcher_outbound) = hub.open_session(identity(3));
        let watcher_id = watcher.session_id;
        hub.connect(watcher).await;
        hub.join(watcher_id, club(), Uuid::from_u128(1_001)).await.expect("join should succeed");

        hub.disconnect(reader_id, CloseKind::Abnormal).await;

        let response = router
            .oneshot(
                Request::builder()
                    .uri(format!("/v1/rooms/{}/presence", Uuid::from_u128(1_001)))
                    .header(AUTHORIZATION, bearer(&verifier, 3))
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("request should return response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let users = body["users"].as_array().expect("users should be an array");
        assert_eq!(users.len(), 2);
        for user in users {
            let expected = if user["userId"] == Uuid::from_u128(2).to_string() {
                "reconnecting"
            } else {
                "connected"
            };
            assert_eq!(user["link"], expected);
        }
    }
}
