//! Route definitions and router builder.

pub mod api;
pub mod health;
pub mod tunnel;

use axum::Router;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the Axum router: control plane at `/`, data plane at `/tunnel`.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", post(api::dispatch))
        .route("/tunnel", get(tunnel::tunnel_handler))
        .route("/health", get(health::health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    fn app_with_state() -> (Router, AppState) {
        let state = AppState::new(ServerConfig::default(), None);
        (build_router(state.clone()), state)
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    fn api_request(target: &str, body: Value) -> Request<Body> {
        Request::post("/")
            .header("x-amz-target", target)
            .header("content-type", "application/x-amz-json-1.1")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap()
    }

    async fn open(app: &Router) -> Value {
        let response = app
            .clone()
            .oneshot(api_request(
                "IoTSecuredTunneling.OpenTunnel",
                json!({"destinationConfig": {"thingName": "thing1", "services": ["ssh"]}}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        body_json(response).await
    }

    fn tunnel_request(query: &str, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::get(format!("/tunnel{query}"));
        if let Some(token) = token {
            builder = builder.header("access-token", token);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let (app, _) = app_with_state();
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["open_tunnels"], 0);
    }

    #[tokio::test]
    async fn open_returns_tokens() {
        let (app, state) = app_with_state();
        let json = open(&app).await;

        let source = json["sourceAccessToken"].as_str().unwrap();
        let destination = json["destinationAccessToken"].as_str().unwrap();
        assert_ne!(source, destination);
        let id = json["tunnelId"].as_str().unwrap();
        assert!(state.get(id).await.is_some());
    }

    #[tokio::test]
    async fn unknown_or_missing_target_is_rejected() {
        let (app, _) = app_with_state();
        let response = app
            .clone()
            .oneshot(api_request("IoTSecuredTunneling.RotateTunnelAccessToken", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(Request::post("/").body(Body::from("{}")).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert!(json["error"].as_str().unwrap().contains("X-Amz-Target"));
    }

    #[tokio::test]
    async fn malformed_body_is_bad_request() {
        let (app, _) = app_with_state();
        let response = app
            .oneshot(
                Request::post("/")
                    .header("x-amz-target", "OpenTunnel")
                    .body(Body::from("not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn close_then_describe() {
        let (app, _) = app_with_state();
        let opened = open(&app).await;
        let id = opened["tunnelId"].as_str().unwrap();

        let response = app
            .clone()
            .oneshot(api_request("CloseTunnel", json!({"tunnelId": id})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(api_request("DescribeTunnel", json!({"tunnelId": id})))
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["tunnel"]["status"], "CLOSED");

        let response = app
            .oneshot(api_request("CloseTunnel", json!({"tunnelId": "missing"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn tunnel_requires_mode() {
        let (app, _) = app_with_state();
        let opened = open(&app).await;
        let token = opened["sourceAccessToken"].as_str().unwrap();

        for query in ["", "?local-proxy-mode=sideways"] {
            let response = app
                .clone()
                .oneshot(tunnel_request(query, Some(token)))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "query {query:?}");
        }
    }

    #[tokio::test]
    async fn tunnel_requires_matching_token() {
        let (app, _) = app_with_state();
        let opened = open(&app).await;
        let destination = opened["destinationAccessToken"].as_str().unwrap();

        for token in [None, Some("bogus"), Some(destination)] {
            let response = app
                .clone()
                .oneshot(tunnel_request("?local-proxy-mode=source", token))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "token {token:?}");
        }
    }

    #[tokio::test]
    async fn closed_tunnel_refuses_peers() {
        let (app, state) = app_with_state();
        let opened = open(&app).await;
        let id = opened["tunnelId"].as_str().unwrap();
        state.get(id).await.unwrap().close();

        let response = app
            .oneshot(tunnel_request(
                "?local-proxy-mode=source",
                opened["sourceAccessToken"].as_str(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn valid_request_without_upgrade_is_bad_request() {
        let (app, _) = app_with_state();
        let opened = open(&app).await;

        let response = app
            .oneshot(tunnel_request(
                "?local-proxy-mode=destination",
                opened["destinationAccessToken"].as_str(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
