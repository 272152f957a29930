use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use ms_infra::ProvisionRequest;
use serde::Serialize;
use uuid::Uuid;

use crate::error::ApiError;
use crate::events::CREATE_KEY;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct AcceptedResponse {
    pub id: String,
    pub status: &'static str,
    pub message: String,
}

/// Validate and enqueue a provisioning request.
///
/// The server id is assigned here and returned so the caller can open
/// `/servers/{id}/events` before the worker picks the request up. Any
/// `server_id` in the body is replaced.
pub async fn create_server(
    State(state): State<AppState>,
    body: Result<Json<ProvisionRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiError> {
    let Json(mut req) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    req.validate()?;

    let server_id = Uuid::new_v4().to_string();
    req.server_id = Some(server_id.clone());

    let payload = serde_json::to_vec(&req).map_err(|e| ApiError::Internal(e.to_string()))?;
    state
        .intake
        .submit(CREATE_KEY, payload)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    tracing::info!(%server_id, name = %req.name, server_type = %req.server_type, "server request queued");

    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            id: server_id,
            status: "queued",
            message: format!("server {} queued for provisioning", req.name),
        }),
    ))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use ms_infra::Orchestrator;
    use ms_infra::testing::{MockEngine, StubArtifacts};
    use tower::ServiceExt;

    use crate::events::CREATE_KEY;
    use crate::publisher::HubPublisher;
    use crate::queue::MessageSource;
    use crate::routes::api_router;
    use crate::routes::test_support::state;
    use crate::worker::{Worker, WorkerLimits};

    async fn json(resp: axum::response::Response) -> serde_json::Value {
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn post(body: serde_json::Value) -> Request<Body> {
        Request::post("/servers")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn body(plan: &str) -> serde_json::Value {
        serde_json::json!({
            "name": "friends",
            "server_type": "paper",
            "server_version": "1.20.1",
            "region": "eu",
            "players_count": 8,
            "plan_type": plan,
            "difficulty": "easy",
            "online_mode": true
        })
    }

    #[tokio::test]
    async fn valid_request_is_queued() {
        let (state, queue) = state(&[]);
        let resp = api_router(state).oneshot(post(body("budget"))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let accepted = json(resp).await;
        assert_eq!(accepted["status"], "queued");

        let delivery = queue.next().await.unwrap();
        assert_eq!(delivery.key, CREATE_KEY);
        let queued: serde_json::Value = serde_json::from_slice(&delivery.payload).unwrap();
        assert_eq!(queued["plan_type"], "budget");
        assert_eq!(queued["server_id"], accepted["id"]);
    }

    #[tokio::test]
    async fn client_supplied_server_id_is_replaced() {
        let (state, queue) = state(&[]);
        let mut req = body("free");
        req["server_id"] = "mine".into();
        let accepted = json(api_router(state).oneshot(post(req)).await.unwrap()).await;

        let id = accepted["id"].as_str().unwrap();
        assert_ne!(id, "mine");
        assert!(uuid::Uuid::parse_str(id).is_ok());

        let delivery = queue.next().await.unwrap();
        let queued: serde_json::Value = serde_json::from_slice(&delivery.payload).unwrap();
        assert_eq!(queued["server_id"], id);
    }

    #[tokio::test]
    async fn returned_id_streams_the_build_to_completion() {
        let (state, queue) = state(&[]);
        let engine = Arc::new(MockEngine::new());
        engine.script_logs(["Done (1.0s)! For help, type \"help\""]);
        let orchestrator = Arc::new(Orchestrator::new(
            engine,
            Arc::new(StubArtifacts::new()),
            Duration::from_secs(30),
        ));
        let worker = Arc::new(Worker::new(
            queue,
            orchestrator,
            Arc::new(HubPublisher::new(state.hub.clone())),
            WorkerLimits {
                max_concurrent_builds: 1,
                max_alive_servers: 5,
            },
        ));
        let app = api_router(state);

        let accepted = json(app.clone().oneshot(post(body("free"))).await.unwrap()).await;
        let id = accepted["id"].as_str().unwrap().to_string();

        let stream = app
            .oneshot(
                Request::get(format!("/servers/{id}/events"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(stream.status(), StatusCode::OK);

        let running = tokio::spawn(worker.run());

        let body = tokio::time::timeout(
            Duration::from_secs(10),
            axum::body::to_bytes(stream.into_body(), usize::MAX),
        )
        .await
        .expect("stream did not reach a terminal event")
        .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();

        assert!(text.starts_with("event: connected\n"));
        assert!(text.contains("event: completed\n"));
        assert!(text.contains(&format!("\"server_id\":\"{id}\"")));
        running.abort();
    }

    #[tokio::test]
    async fn invalid_plan_is_rejected() {
        let (state, queue) = state(&[]);
        let resp = api_router(state).oneshot(post(body("gold"))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn malformed_body_gets_json_error() {
        let (state, queue) = state(&[]);
        let resp = api_router(state)
            .oneshot(post(serde_json::json!({ "name": "friends" })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(body["error"].is_string());
        assert_eq!(queue.pending(), 0);
    }
}
