use axum::Json;
use axum::extract::{Path, State};
use ms_infra::types::ServerType;
use ms_infra::versions::available_versions;

use crate::error::ApiError;
use crate::state::AppState;

/// Release versions for a server type, newest first.
pub async fn list_versions(
    State(state): State<AppState>,
    Path(server_type): Path<String>,
) -> Result<Json<Vec<String>>, ApiError> {
    let server_type: ServerType = server_type.parse()?;
    let versions = available_versions(state.versions.as_ref(), server_type).await?;
    Ok(Json(versions))
}
