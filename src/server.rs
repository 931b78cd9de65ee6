use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::{
    command::CommandRunner,
    error::ScanError,
    orchestrator::ScanOrchestrator,
    registry::{DeviceRegistry, NewDevice},
    session::SessionRegistry,
    transport::Transport,
    types::ScanRequest,
};

pub struct AppState<T, R> {
    pub orchestrator: Arc<ScanOrchestrator<T, R>>,
    pub sessions: SessionRegistry<T, R>,
    pub registry: Arc<DeviceRegistry>,
}

impl<T, R> Clone for AppState<T, R> {
    fn clone(&self) -> Self {
        Self {
            orchestrator: self.orchestrator.clone(),
            sessions: self.sessions.clone(),
            registry: self.registry.clone(),
        }
    }
}

impl<T: Transport, R: CommandRunner> AppState<T, R> {
    pub fn new(orchestrator: Arc<ScanOrchestrator<T, R>>, registry: Arc<DeviceRegistry>) -> Self {
        Self {
            sessions: SessionRegistry::new(orchestrator.clone()),
            orchestrator,
            registry,
        }
    }
}

/// `{ success: false, error, details }` with the matching status code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    error: String,
    details: Option<Value>,
}

impl ApiError {
    fn bad_request(error: impl Into<String>, details: Option<Value>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: error.into(),
            details,
        }
    }

    fn not_found(error: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            error: error.into(),
            details: None,
        }
    }

    fn internal(error: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error: error.into(),
            details: None,
        }
    }
}

impl From<ScanError> for ApiError {
    fn from(e: ScanError) -> Self {
        match &e {
            ScanError::Validation(fields) => {
                Self::bad_request("validation failed", serde_json::to_value(fields).ok())
            }
            ScanError::RangeTooLarge { .. } => {
                Self::bad_request("range too large", Some(Value::String(e.to_string())))
            }
            _ => {
                tracing::error!(error = %e, "request failed");
                Self::internal("scan failed")
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        Self::bad_request("malformed request body", Some(Value::String(e.body_text())))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = json!({ "success": false, "error": self.error });
        if let Some(details) = self.details {
            body["details"] = details;
        }
        (self.status, Json(body)).into_response()
    }
}

fn ok<S: Serialize>(key: &str, value: S) -> Response {
    match serde_json::to_value(value) {
        Ok(value) => {
            let mut body = json!({ "success": true });
            body[key] = value;
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "response encoding failed");
            ApiError::internal("response encoding failed").into_response()
        }
    }
}

pub fn router<T: Transport, R: CommandRunner>(state: AppState<T, R>) -> Router {
    let scanner = Router::new()
        .route("/network-scan", post(network_scan::<T, R>))
        .route("/printers", get(list_printers::<T, R>).post(add_printer::<T, R>))
        .route(
            "/sessions",
            get(list_sessions::<T, R>).post(start_session::<T, R>),
        )
        .route(
            "/sessions/{id}",
            get(get_session::<T, R>).delete(cancel_session::<T, R>),
        )
        .with_state(state);

    Router::new()
        .nest("/scanner", scanner)
        .layer(TraceLayer::new_for_http())
}

pub async fn spawn_server<T: Transport, R: CommandRunner>(
    bind: &str,
    state: AppState<T, R>,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(addr = %listener.local_addr()?, "serving scanner API");
    let pruner = state.sessions.spawn_pruner();
    let served = axum::serve(listener, router(state)).await;
    pruner.abort();
    served?;
    Ok(())
}

async fn network_scan<T: Transport, R: CommandRunner>(
    State(app): State<AppState<T, R>>,
    payload: Result<Json<ScanRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(req) = payload?;
    let result = app.orchestrator.execute(&req).await?;
    Ok(ok("result", result))
}

async fn list_printers<T: Transport, R: CommandRunner>(
    State(app): State<AppState<T, R>>,
) -> Response {
    ok("printers", app.registry.list_scanners().await)
}

async fn add_printer<T: Transport, R: CommandRunner>(
    State(app): State<AppState<T, R>>,
    payload: Result<Json<NewDevice>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(device) = payload?;
    let saved = app.registry.upsert(device).await?;
    Ok(ok("printer", saved))
}

async fn start_session<T: Transport, R: CommandRunner>(
    State(app): State<AppState<T, R>>,
    payload: Result<Json<ScanRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(req) = payload?;
    let id = app.sessions.start(req).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "success": true, "sessionId": id })),
    )
        .into_response())
}

async fn list_sessions<T: Transport, R: CommandRunner>(
    State(app): State<AppState<T, R>>,
) -> Response {
    let mut sessions = app.sessions.list().await;
    sessions.sort_by(|a, b| a.started_at.cmp(&b.started_at));
    ok("sessions", sessions)
}

fn session_id(raw: &str) -> Result<Uuid, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::not_found("unknown session"))
}

async fn get_session<T: Transport, R: CommandRunner>(
    State(app): State<AppState<T, R>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = session_id(&id)?;
    match app.sessions.get(&id).await {
        Some(session) => Ok(ok("session", session)),
        None => Err(ApiError::not_found("unknown session")),
    }
}

async fn cancel_session<T: Transport, R: CommandRunner>(
    State(app): State<AppState<T, R>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = session_id(&id)?;
    if app.sessions.cancel(&id).await {
        Ok(ok("sessionId", id))
    } else {
        Err(ApiError::not_found("unknown session"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::ScriptedRunner;
    use crate::config::{EnvHints, ScanConfig};
    use crate::transport::FixtureTransport;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use std::net::Ipv4Addr;
    use tower::ServiceExt;

    fn app(transport: FixtureTransport) -> Router {
        let orch = ScanOrchestrator::new(
            Arc::new(transport),
            Arc::new(ScriptedRunner::new()),
            ScanConfig::default(),
            EnvHints::default(),
        );
        router(AppState::new(
            Arc::new(orch),
            Arc::new(DeviceRegistry::in_memory()),
        ))
    }

    async fn call(app: &Router, method: &str, uri: &str, body: &str) -> (StatusCode, Value) {
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn network_scan_returns_envelope() {
        let ip = Ipv4Addr::new(192, 168, 7, 3);
        let app = app(FixtureTransport::new().open(ip, 9100));
        let (status, body) = call(
            &app,
            "POST",
            "/scanner/network-scan",
            r#"{"startIp":"192.168.7.2","endIp":"192.168.7.4","ports":[9100]}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["result"]["totalScanned"], 3);
        assert_eq!(body["result"]["printers"][0]["ip"], "192.168.7.3");
        assert_eq!(body["result"]["printers"][0]["hasScanner"], true);
    }

    #[tokio::test]
    async fn validation_errors_are_400_with_details() {
        let app = app(FixtureTransport::new());
        let (status, body) = call(
            &app,
            "POST",
            "/scanner/network-scan",
            r#"{"networkRange":"10.0.0.0/24","ports":[0]}"#,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert_eq!(body["details"][0]["field"], "ports[0]");

        let (status, body) = call(
            &app,
            "POST",
            "/scanner/network-scan",
            r#"{"networkRange":"10.0.0.0/23"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "range too large");

        let (status, _) = call(&app, "POST", "/scanner/network-scan", "{not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn printers_roundtrip_through_registry() {
        let app = app(FixtureTransport::new());
        let (status, body) = call(
            &app,
            "POST",
            "/scanner/printers",
            r#"{"ip":"192.168.1.11","port":9100,"name":"Office","vendor":"Canon","scannerType":"MFP"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["printer"]["id"], 1);
        assert_eq!(body["printer"]["isActive"], true);

        let (status, body) = call(&app, "GET", "/scanner/printers", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["printers"].as_array().map(Vec::len), Some(1));
        assert_eq!(body["printers"][0]["name"], "Office");
    }

    #[tokio::test]
    async fn unknown_session_is_404() {
        let app = app(FixtureTransport::new());
        let uri = format!("/scanner/sessions/{}", Uuid::new_v4());
        let (status, body) = call(&app, "GET", &uri, "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);
        let (status, _) = call(&app, "DELETE", "/scanner/sessions/not-a-uuid", "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn session_is_created_and_visible() {
        let app = app(FixtureTransport::new());
        let (status, body) = call(
            &app,
            "POST",
            "/scanner/sessions",
            r#"{"startIp":"10.4.0.1","endIp":"10.4.0.2","ports":[9100]}"#,
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let id = body["sessionId"].as_str().unwrap().to_string();
        let (status, body) = call(&app, "GET", &format!("/scanner/sessions/{id}"), "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["session"]["id"], id.as_str());

        let (status, body) = call(&app, "GET", "/scanner/sessions", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["sessions"].as_array().map(Vec::len), Some(1));
        assert_eq!(body["sessions"][0]["id"], id.as_str());
    }
}
