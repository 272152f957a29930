use axum::Json;
use axum::extract::Query;
use axum::extract::rejection::QueryRejection;
use ms_infra::policy::ResourcePolicy;
use ms_infra::types::ServerType;
use serde::{Deserialize, Serialize};

use crate::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct RecommendationQuery {
    pub server_type: String,
    pub player_count: u32,
}

#[derive(Debug, Serialize)]
pub struct Recommendation {
    pub server_type: ServerType,
    pub player_count: u32,
    pub recommendation: &'static str,
}

/// Memory size to suggest for an expected player count.
pub async fn recommended_plans(
    query: Result<Query<RecommendationQuery>, QueryRejection>,
) -> Result<Json<Recommendation>, ApiError> {
    let Query(query) = query.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let server_type: ServerType = query.server_type.parse()?;
    let recommendation = ResourcePolicy.recommend_memory(server_type, query.player_count)?;

    Ok(Json(Recommendation {
        server_type,
        player_count: query.player_count,
        recommendation,
    }))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use crate::routes::api_router;
    use crate::routes::test_support::state;

    async fn get(uri: &str) -> (StatusCode, serde_json::Value) {
        let (state, _) = state(&[]);
        let resp = api_router(state)
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn modded_servers_get_larger_recommendations() {
        let (status, body) =
            get("/servers/recommended-plans?server_type=forge&player_count=25").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["recommendation"], "6GB");
        assert_eq!(body["server_type"], "forge");

        let (_, body) = get("/servers/recommended-plans?server_type=paper&player_count=25").await;
        assert_eq!(body["recommendation"], "4GB");
    }

    #[tokio::test]
    async fn bad_queries_are_json_errors() {
        for uri in [
            "/servers/recommended-plans?server_type=bukkit&player_count=5",
            "/servers/recommended-plans?server_type=paper&player_count=500",
            "/servers/recommended-plans?server_type=paper&player_count=many",
            "/servers/recommended-plans?server_type=paper",
        ] {
            let (status, body) = get(uri).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
            assert!(body["error"].is_string(), "{uri}");
        }
    }
}
