use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::error::{EngineError, ErrorKind};
use crate::logic::{CrudEngine, Description, RemoveKey};
use crate::model::{InstanceGraph, InstanceView, SessionId};
use crate::store::sessions::SessionInfo;
use crate::store::traits::GraphStore;

pub type AppState<S> = Arc<CrudEngine<S>>;

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;

/// Simple health check endpoint
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

#[derive(Debug, Serialize)]
pub struct ListResponse<T> {
    pub items: Vec<T>,
    pub total: usize,
}

impl<T> ListResponse<T> {
    fn new(items: Vec<T>) -> Self {
        Self {
            total: items.len(),
            items,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: ErrorKind,
}

impl ErrorResponse {
    pub fn new(kind: ErrorKind, message: &str) -> Self {
        Self {
            error: message.to_string(),
            kind,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
    pub session_id: SessionId,
    pub session: SessionInfo,
    pub routes: Description,
}

#[derive(Debug, Deserialize)]
pub struct DescribeQuery {
    /// "openapi" renders an OpenAPI document instead of the plain listing
    pub format: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RemoveQuery {
    pub index: Option<String>,
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::SessionNotFound
        | ErrorKind::ClassNotFound
        | ErrorKind::InstanceNotFound
        | ErrorKind::FeatureNotFound
        | ErrorKind::IndexOutOfBounds
        | ErrorKind::ElementNotFound => StatusCode::NOT_FOUND,
        ErrorKind::SchemaParseError
        | ErrorKind::ClassMismatch
        | ErrorKind::AbstractClass
        | ErrorKind::TypeCoercionError
        | ErrorKind::ReferenceNotFound
        | ErrorKind::InvalidReferenceTarget
        | ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
        ErrorKind::ContainmentCycle => StatusCode::CONFLICT,
        ErrorKind::PersistenceError => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: EngineError) -> (StatusCode, Json<ErrorResponse>) {
    let kind = err.kind();
    let status = status_for(kind);
    if status.is_server_error() {
        warn!("Request failed: {}", err);
    }
    (status, Json(ErrorResponse::new(kind, &err.to_string())))
}

/// Parse an optional JSON body. An empty body reads as no value.
fn optional_json(body: &Bytes) -> Result<Option<Value>, EngineError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice(body)
        .map(Some)
        .map_err(|e| EngineError::invalid_request(format!("malformed JSON body: {}", e)))
}

fn required_json(body: &Bytes) -> Result<Value, EngineError> {
    optional_json(body)?.ok_or_else(|| EngineError::invalid_request("request body is required"))
}

/// Feature endpoints take `{ "value": ... }`; an explicit null is a value.
fn feature_value(body: &Bytes) -> Result<Value, EngineError> {
    match required_json(body)? {
        Value::Object(mut map) => map
            .remove("value")
            .ok_or_else(|| EngineError::invalid_request("missing 'value' in request body")),
        _ => Err(EngineError::invalid_request("request body must be a JSON object")),
    }
}

// Sessions

pub async fn create_session<S: GraphStore + 'static>(
    State(engine): State<AppState<S>>,
    body: Bytes,
) -> ApiResult<CreateSessionResponse> {
    let (session, routes) = engine.create_session(&body).await.map_err(error_response)?;
    Ok(Json(CreateSessionResponse {
        session_id: session.id.clone(),
        session: session.info(),
        routes,
    }))
}

pub async fn list_sessions<S: GraphStore + 'static>(
    State(engine): State<AppState<S>>,
) -> Json<ListResponse<SessionInfo>> {
    Json(ListResponse::new(engine.list_sessions()))
}

pub async fn get_session<S: GraphStore + 'static>(
    State(engine): State<AppState<S>>,
    Path(session_id): Path<SessionId>,
) -> ApiResult<SessionInfo> {
    engine.session_info(&session_id).map(Json).map_err(error_response)
}

pub async fn delete_session<S: GraphStore + 'static>(
    State(engine): State<AppState<S>>,
    Path(session_id): Path<SessionId>,
) -> ApiResult<Value> {
    engine
        .destroy_session(&session_id)
        .await
        .map_err(error_response)?;
    Ok(Json(serde_json::json!({
        "message": "Session removed",
        "sessionId": session_id,
    })))
}

pub async fn describe_session<S: GraphStore + 'static>(
    State(engine): State<AppState<S>>,
    Path(session_id): Path<SessionId>,
    Query(query): Query<DescribeQuery>,
) -> ApiResult<Value> {
    let description = engine.describe_session(&session_id).map_err(error_response)?;
    let rendered = match query.format.as_deref() {
        Some("openapi") => description.to_openapi(),
        _ => serde_json::to_value(&description).map_err(|e| {
            error_response(EngineError::invalid_request(format!(
                "could not render description: {}",
                e
            )))
        })?,
    };
    Ok(Json(rendered))
}

pub async fn export_model<S: GraphStore + 'static>(
    State(engine): State<AppState<S>>,
    Path(session_id): Path<SessionId>,
) -> ApiResult<InstanceGraph> {
    let graph = engine.export_graph(&session_id).map_err(error_response)?;
    Ok(Json(InstanceGraph::clone(&graph)))
}

pub async fn import_model<S: GraphStore + 'static>(
    State(engine): State<AppState<S>>,
    Path(session_id): Path<SessionId>,
    body: Bytes,
) -> ApiResult<SessionInfo> {
    let graph: InstanceGraph = serde_json::from_slice(&body)
        .map_err(|e| EngineError::invalid_request(format!("malformed model document: {}", e)))
        .map_err(error_response)?;
    engine
        .import_graph(&session_id, graph)
        .await
        .map_err(error_response)?;
    engine.session_info(&session_id).map(Json).map_err(error_response)
}

pub async fn reload_model<S: GraphStore + 'static>(
    State(engine): State<AppState<S>>,
    Path(session_id): Path<SessionId>,
) -> ApiResult<SessionInfo> {
    engine
        .reload_graph(&session_id)
        .await
        .map(Json)
        .map_err(error_response)
}

// Instances

pub async fn create_instance<S: GraphStore + 'static>(
    State(engine): State<AppState<S>>,
    Path((session_id, class_name)): Path<(SessionId, String)>,
    body: Bytes,
) -> ApiResult<InstanceView> {
    let initial = optional_json(&body).map_err(error_response)?;
    engine
        .create_instance(&session_id, &class_name, initial.as_ref())
        .await
        .map(Json)
        .map_err(error_response)
}

pub async fn list_instances<S: GraphStore + 'static>(
    State(engine): State<AppState<S>>,
    Path((session_id, class_name)): Path<(SessionId, String)>,
) -> ApiResult<ListResponse<InstanceView>> {
    let items = engine
        .list_instances(&session_id, &class_name)
        .map_err(error_response)?;
    Ok(Json(ListResponse::new(items)))
}

pub async fn get_instance<S: GraphStore + 'static>(
    State(engine): State<AppState<S>>,
    Path((session_id, class_name, id)): Path<(SessionId, String, String)>,
) -> ApiResult<InstanceView> {
    engine
        .read_instance(&session_id, &class_name, &id)
        .map(Json)
        .map_err(error_response)
}

pub async fn update_instance<S: GraphStore + 'static>(
    State(engine): State<AppState<S>>,
    Path((session_id, class_name, id)): Path<(SessionId, String, String)>,
    body: Bytes,
) -> ApiResult<InstanceView> {
    let fields = required_json(&body).map_err(error_response)?;
    engine
        .update_instance(&session_id, &class_name, &id, &fields)
        .await
        .map(Json)
        .map_err(error_response)
}

pub async fn delete_instance<S: GraphStore + 'static>(
    State(engine): State<AppState<S>>,
    Path((session_id, class_name, id)): Path<(SessionId, String, String)>,
) -> ApiResult<Value> {
    let removed = engine
        .delete_instance(&session_id, &class_name, &id)
        .await
        .map_err(error_response)?;
    Ok(Json(serde_json::json!({
        "message": format!("{} {} deleted", class_name, id),
        "removed": removed,
    })))
}

// Features

pub async fn update_feature<S: GraphStore + 'static>(
    State(engine): State<AppState<S>>,
    Path((session_id, class_name, id, feature)): Path<(SessionId, String, String, String)>,
    body: Bytes,
) -> ApiResult<InstanceView> {
    let value = feature_value(&body).map_err(error_response)?;
    engine
        .update_feature(&session_id, &class_name, &id, &feature, &value)
        .await
        .map(Json)
        .map_err(error_response)
}

pub async fn append_to_feature<S: GraphStore + 'static>(
    State(engine): State<AppState<S>>,
    Path((session_id, class_name, id, feature)): Path<(SessionId, String, String, String)>,
    body: Bytes,
) -> ApiResult<InstanceView> {
    let value = feature_value(&body).map_err(error_response)?;
    engine
        .append_to_feature(&session_id, &class_name, &id, &feature, &value)
        .await
        .map(Json)
        .map_err(error_response)
}

pub async fn clear_feature<S: GraphStore + 'static>(
    State(engine): State<AppState<S>>,
    Path((session_id, class_name, id, feature)): Path<(SessionId, String, String, String)>,
) -> ApiResult<InstanceView> {
    engine
        .clear_feature(&session_id, &class_name, &id, &feature)
        .await
        .map(Json)
        .map_err(error_response)
}

/// `?index=N` removes by position; otherwise the path segment is the value
/// (attributes) or identity (references) to remove.
pub async fn remove_element<S: GraphStore + 'static>(
    State(engine): State<AppState<S>>,
    Path((session_id, class_name, id, feature, item_key)): Path<(
        SessionId,
        String,
        String,
        String,
        String,
    )>,
    Query(query): Query<RemoveQuery>,
) -> ApiResult<InstanceView> {
    let key = match query.index {
        Some(index) => RemoveKey::Index(index.trim().parse().map_err(|_| {
            error_response(EngineError::invalid_request(format!(
                "index must be an integer, got '{}'",
                index
            )))
        })?),
        None => RemoveKey::Value(item_key),
    };
    engine
        .remove_element(&session_id, &class_name, &id, &feature, key)
        .await
        .map(Json)
        .map_err(error_response)
}
