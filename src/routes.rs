use crate::handlers;
use crate::state::AppState;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/v1/tests", get(handlers::list_tests))
        .route("/api/v1/tests/:id/publish", post(handlers::publish_test))
        .route("/api/v1/tests/:id/unpublish", post(handlers::unpublish_test))
        .route("/api/v1/sessions", post(handlers::create_session))
        .route(
            "/api/v1/sessions/:handle",
            get(handlers::get_session).delete(handlers::delete_session),
        )
        .route("/api/v1/sessions/:handle/answer", post(handlers::select_answer))
        .route("/api/v1/sessions/:handle/navigate", post(handlers::navigate))
        .route("/api/v1/sessions/:handle/mark", post(handlers::toggle_mark))
        .route("/api/v1/sessions/:handle/submit", post(handlers::submit_session))
        .route("/ws/sessions/:handle", get(handlers::ws_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::models::fixtures::{single, test_with};
    use crate::store::InMemoryStore;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn router() -> Router {
        build_router(AppState::new(InMemoryStore::new(), Settings::default()))
    }

    #[tokio::test]
    async fn health_is_ok() {
        let response = router()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let response = router()
            .oneshot(
                Request::builder()
                    .uri("/api/v1/sessions/nope")
                    .header("x-user-id", "u1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn missing_user_header_is_unauthorized() {
        let response = router()
            .oneshot(Request::builder().uri("/api/v1/sessions/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    fn post(uri: &str, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method("POST").uri(uri);
        if let Some(token) = token {
            builder = builder.header("x-admin-token", token);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn unpublish_needs_the_admin_token_and_hides_the_test() {
        let settings = Settings {
            admin_token: Some("s3cret".into()),
            ..Settings::default()
        };
        let state = AppState::new(InMemoryStore::new(), settings);
        state.db.upsert_test(test_with(vec![single("q1", 0)])).await.unwrap();
        assert!(state.store.load_published_test("t1").await.unwrap().is_some());
        let app = build_router(state.clone());

        let forbidden = app.clone().oneshot(post("/api/v1/tests/t1/unpublish", Some("wrong"))).await.unwrap();
        assert_eq!(forbidden.status(), StatusCode::FORBIDDEN);
        let missing = app.clone().oneshot(post("/api/v1/tests/nope/unpublish", Some("s3cret"))).await.unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let ok = app.clone().oneshot(post("/api/v1/tests/t1/unpublish", Some("s3cret"))).await.unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        assert!(state.store.load_published_test("t1").await.unwrap().is_none());

        let ok = app.oneshot(post("/api/v1/tests/t1/publish", Some("s3cret"))).await.unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        assert!(state.store.load_published_test("t1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn publish_routes_are_off_without_a_token() {
        let response = router().oneshot(post("/api/v1/tests/t1/publish", Some(""))).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}
