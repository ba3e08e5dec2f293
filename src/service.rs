//! HTTP boundary.
//!
//! Routes:
//!
//! - `GET  /test-rest?giveMe=&responseFile=` canned status and body
//! - `POST /test-rest?giveMe=&responseFile=&schemaFile=` same, after the
//!   optional schema check of the JSON body
//! - `POST /test-rest/queues?brokerName=` forward the JSON object body
//! - `GET  /health` readiness check

use crate::broker::{BrokerBridge, BrokerClient, BrokerError, Payload};
use crate::config::TestRestConfig;
use crate::fixture::FixtureStore;
use crate::resolver::{OutcomeResolver, ResolveError, StatusOutcome, DEFAULT_STATUS};
use crate::schema::{SchemaError, SchemaGate};
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

const JSON_CONTENT_TYPE: &str = "application/json";

/// Components shared by every request.
#[derive(Clone)]
pub struct AppState {
    resolver: OutcomeResolver,
    gate: SchemaGate,
    bridge: BrokerBridge,
}

impl AppState {
    pub fn new(resolver: OutcomeResolver, gate: SchemaGate, bridge: BrokerBridge) -> Self {
        Self {
            resolver,
            gate,
            bridge,
        }
    }

    /// Wire the default components from configuration.
    pub fn from_config(config: &TestRestConfig, broker: Arc<dyn BrokerClient>) -> Self {
        Self::new(
            OutcomeResolver::with_tracing(FixtureStore::new(&config.fixtures.response_dir)),
            SchemaGate::with_default_validator(FixtureStore::new(&config.fixtures.schema_dir)),
            BrokerBridge::new(broker, config.broker.send_timeout()),
        )
    }
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/test-rest", get(get_outcome).post(post_outcome))
        .route("/test-rest/queues", post(forward_to_queue))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Query parameters of the `/test-rest` endpoints.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeParams {
    #[serde(default = "default_give_me")]
    pub give_me: i64,
    #[serde(default)]
    pub response_file: Option<String>,
    #[serde(default)]
    pub schema_file: Option<String>,
}

fn default_give_me() -> i64 {
    DEFAULT_STATUS
}

/// Query parameters of the queue endpoint.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueParams {
    pub broker_name: String,
}

async fn get_outcome(
    State(state): State<AppState>,
    Query(params): Query<OutcomeParams>,
) -> Result<Response, ApiError> {
    let outcome = state
        .resolver
        .resolve(params.give_me, params.response_file.as_deref())
        .await?;
    Ok(outcome_response(outcome))
}

async fn post_outcome(
    State(state): State<AppState>,
    Query(params): Query<OutcomeParams>,
    Json(document): Json<Value>,
) -> Result<Response, ApiError> {
    // Reject the payload before any fixture is read
    state
        .gate
        .validate(&document, params.schema_file.as_deref())
        .await?;
    let outcome = state
        .resolver
        .resolve(params.give_me, params.response_file.as_deref())
        .await?;
    Ok(outcome_response(outcome))
}

async fn forward_to_queue(
    State(state): State<AppState>,
    Query(params): Query<QueueParams>,
    Json(payload): Json<Payload>,
) -> Result<StatusCode, ApiError> {
    // Empty 200 once the broker has accepted the payload
    state.bridge.forward(&params.broker_name, payload).await?;
    Ok(StatusCode::OK)
}

async fn health() -> Json<Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

fn outcome_response(outcome: StatusOutcome) -> Response {
    debug!(
        status = outcome.status.as_u16(),
        reason = outcome.reason,
        "Responding"
    );
    (
        outcome.status,
        [(header::CONTENT_TYPE, JSON_CONTENT_TYPE)],
        outcome.body,
    )
        .into_response()
}

/// Request failures surfaced to the caller.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl ApiError {
    fn status_and_kind(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Resolve(ResolveError::UnknownStatus(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "unknown_status")
            }
            ApiError::Schema(SchemaError::Validation(_)) => {
                (StatusCode::BAD_REQUEST, "validation_failed")
            }
            ApiError::Schema(SchemaError::Unavailable { .. } | SchemaError::Invalid { .. }) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "schema_unavailable")
            }
            ApiError::Broker(BrokerError::Disabled) => {
                (StatusCode::SERVICE_UNAVAILABLE, "broker_disabled")
            }
            ApiError::Broker(BrokerError::Timeout { .. }) => {
                (StatusCode::GATEWAY_TIMEOUT, "broker_timeout")
            }
            ApiError::Broker(_) => (StatusCode::BAD_GATEWAY, "broker_error"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = self.status_and_kind();
        warn!(status = status.as_u16(), error = %self, "Request failed");

        // Build the error body
        let mut body = serde_json::json!({
            "error": kind,
            "message": self.to_string(),
        });
        if let ApiError::Schema(SchemaError::Validation(failure)) = &self {
            body["message"] = Value::String(failure.message());
            body["violations"] = serde_json::json!(failure.violations());
        }
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{DisabledBroker, QueueMessage, Subscription};
    use crate::resolver::{RecordingEventSink, ResolverEvent};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::sync::Mutex;
    use std::time::Duration;
    use tower::ServiceExt;

    const FILE_NAME: &str = "test_file.json";
    const FILE_CONTENT: &str = "{ \"response\" : \"as_expected\" }";
    const PERSON_SCHEMA: &str = r#"{
  "$schema": "http://json-schema.org/draft-07/schema#",
  "type": "object",
  "properties": {
    "firstName": { "type": "string" },
    "lastName": { "type": "string" },
    "age": { "type": "number" }
  },
  "required": ["firstName", "lastName"]
}"#;

    #[derive(Default)]
    struct RecordingBroker {
        sent: Mutex<Vec<QueueMessage>>,
    }

    #[async_trait]
    impl BrokerClient for RecordingBroker {
        async fn send(&self, message: QueueMessage, _timeout: Duration) -> Result<(), BrokerError> {
            self.sent.lock().unwrap().push(message);
            Ok(())
        }

        async fn subscribe(&self, source: &str) -> Result<Subscription, BrokerError> {
            Err(BrokerError::UnknownDestination(source.to_string()))
        }
    }

    struct TestApp {
        _responses: tempfile::TempDir,
        _schemas: tempfile::TempDir,
        router: Router,
        events: Arc<RecordingEventSink>,
    }

    fn test_app(broker: Arc<dyn BrokerClient>) -> TestApp {
        let responses = tempfile::tempdir().unwrap();
        std::fs::write(responses.path().join(FILE_NAME), FILE_CONTENT).unwrap();
        let schemas = tempfile::tempdir().unwrap();
        std::fs::write(schemas.path().join("schema.json"), PERSON_SCHEMA).unwrap();

        let events = Arc::new(RecordingEventSink::new());
        let state = AppState::new(
            OutcomeResolver::new(FixtureStore::new(responses.path()), events.clone()),
            SchemaGate::with_default_validator(FixtureStore::new(schemas.path())),
            BrokerBridge::new(broker, Duration::from_secs(1)),
        );

        TestApp {
            _responses: responses,
            _schemas: schemas,
            router: router(state),
            events,
        }
    }

    async fn send(app: &TestApp, request: Request<Body>) -> (StatusCode, String, Option<String>) {
        let resp = app.router.clone().oneshot(request).await.unwrap();
        let status = resp.status();
        let content_type = resp
            .headers()
            .get(header::CONTENT_TYPE)
            .map(|v| v.to_str().unwrap().to_string());
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(bytes.to_vec()).unwrap(), content_type)
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_get_defaults_to_200() {
        let app = test_app(Arc::new(DisabledBroker));
        let (status, body, content_type) = send(&app, get_req("/test-rest")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, r#"{"response":"OK"}"#);
        assert_eq!(content_type.as_deref(), Some("application/json"));
    }

    #[tokio::test]
    async fn test_get_requested_status() {
        let app = test_app(Arc::new(DisabledBroker));

        let (status, body, _) = send(&app, get_req("/test-rest?giveMe=400")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, r#"{"response":"Bad Request"}"#);

        let (status, body, _) = send(&app, get_req("/test-rest?giveMe=503")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, r#"{"response":"Service Unavailable"}"#);
    }

    #[tokio::test]
    async fn test_get_with_response_file() {
        let app = test_app(Arc::new(DisabledBroker));

        let (status, body, _) =
            send(&app, get_req(&format!("/test-rest?giveMe=201&responseFile={FILE_NAME}"))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body, FILE_CONTENT);

        let (status, body, _) =
            send(&app, get_req(&format!("/test-rest?giveMe=400&responseFile={FILE_NAME}"))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, FILE_CONTENT);
    }

    #[tokio::test]
    async fn test_get_missing_fixture_falls_back() {
        let app = test_app(Arc::new(DisabledBroker));

        let (status, body, _) =
            send(&app, get_req("/test-rest?giveMe=202&responseFile=nope.json")).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body, r#"{"response":"Accepted"}"#);

        let events = app.events.events();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            ResolverEvent::FixtureUnavailable { fixture, .. } if fixture == "nope.json"
        ));
    }

    #[tokio::test]
    async fn test_unknown_status_is_server_error() {
        let app = test_app(Arc::new(DisabledBroker));

        for uri in ["/test-rest?giveMe=299", "/test-rest?giveMe=70000"] {
            let (status, body, _) = send(&app, get_req(uri)).await;
            assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
            let body: Value = serde_json::from_str(&body).unwrap();
            assert_eq!(body["error"], "unknown_status");
        }
    }

    #[tokio::test]
    async fn test_informational_status_answered_with_json_error_on_the_wire() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let app = test_app(Arc::new(DisabledBroker));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = app.router.clone();
        let server = tokio::spawn(async move { axum::serve(listener, router).await });

        for code in [100, 101, 103] {
            let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
            let request = format!(
                "GET /test-rest?giveMe={code} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n"
            );
            stream.write_all(request.as_bytes()).await.unwrap();

            let mut raw = String::new();
            tokio::time::timeout(Duration::from_secs(5), stream.read_to_string(&mut raw))
                .await
                .expect("server did not answer")
                .unwrap();

            assert!(raw.starts_with("HTTP/1.1 500"), "unexpected response: {raw}");
            let (_, body) = raw.split_once("\r\n\r\n").unwrap();
            let body: Value = serde_json::from_str(body).unwrap();
            assert_eq!(body["error"], "unknown_status");
            assert_eq!(body["message"], format!("unknown HTTP status code: {code}"));
        }

        server.abort();
    }

    #[tokio::test]
    async fn test_post_defaults_to_200() {
        let app = test_app(Arc::new(DisabledBroker));
        let (status, body, _) = send(&app, post_json("/test-rest", "{}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, r#"{"response":"OK"}"#);
    }

    #[tokio::test]
    async fn test_post_requested_status_and_file() {
        let app = test_app(Arc::new(DisabledBroker));

        let (status, body, _) = send(&app, post_json("/test-rest?giveMe=503", "{}")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, r#"{"response":"Service Unavailable"}"#);

        let (status, body, _) = send(
            &app,
            post_json(&format!("/test-rest?giveMe=201&responseFile={FILE_NAME}"), "{}"),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body, FILE_CONTENT);
    }

    #[tokio::test]
    async fn test_post_valid_payloads_accepted() {
        let app = test_app(Arc::new(DisabledBroker));

        for payload in [
            r#"{"firstName": "Peter", "lastName": "Griffin"}"#,
            r#"{"firstName": "Peter", "lastName": "Griffin", "age": 42}"#,
            r#"{"firstName": "Peter", "lastName": "Griffin", "spouse": "Lois Griffin"}"#,
        ] {
            let (status, _, _) =
                send(&app, post_json("/test-rest?schemaFile=schema.json", payload)).await;
            assert_eq!(status, StatusCode::OK, "payload {payload} should be accepted");
        }
    }

    #[tokio::test]
    async fn test_post_wrong_type_rejected() {
        let app = test_app(Arc::new(DisabledBroker));
        let (status, body, _) = send(
            &app,
            post_json(
                "/test-rest?schemaFile=schema.json",
                r#"{"firstName": "Peter", "lastName": "Griffin", "age": "42"}"#,
            ),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        let body: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(body["error"], "validation_failed");
        assert_eq!(body["message"], "age: expected type: Number, found: String");
        assert_eq!(body["violations"][0]["kind"], "type_mismatch");
        assert_eq!(body["violations"][0]["path"], "age");
    }

    #[tokio::test]
    async fn test_post_missing_required_rejected_before_resolution() {
        let app = test_app(Arc::new(DisabledBroker));
        let (status, body, _) = send(
            &app,
            post_json(
                "/test-rest?schemaFile=schema.json&giveMe=201&responseFile=missing.json",
                r#"{"firstName": "Peter"}"#,
            ),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        let body: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(body["message"], "required key [lastName] not found");
        assert!(app.events.events().is_empty());
    }

    #[tokio::test]
    async fn test_post_missing_schema_is_server_error() {
        let app = test_app(Arc::new(DisabledBroker));
        let (status, body, _) =
            send(&app, post_json("/test-rest?schemaFile=absent.json", "{}")).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let body: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(body["error"], "schema_unavailable");
    }

    #[tokio::test]
    async fn test_post_without_body_rejected() {
        let app = test_app(Arc::new(DisabledBroker));
        let request = Request::builder()
            .method("POST")
            .uri("/test-rest")
            .body(Body::empty())
            .unwrap();
        let (status, _, _) = send(&app, request).await;
        assert!(status.is_client_error());
    }

    #[tokio::test]
    async fn test_queue_forwards_payload_once() {
        let broker = Arc::new(RecordingBroker::default());
        let app = test_app(broker.clone());

        let (status, body, _) = send(
            &app,
            post_json("/test-rest/queues?brokerName=testQueue", r#"{ "key" : "value"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "");

        let sent = broker.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].destination, "testQueue");
        assert_eq!(Value::Object(sent[0].payload.clone()), serde_json::json!({"key": "value"}));
    }

    #[tokio::test]
    async fn test_queue_disabled_broker() {
        let app = test_app(Arc::new(DisabledBroker));
        let (status, body, _) = send(
            &app,
            post_json("/test-rest/queues?brokerName=testQueue", "{}"),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let body: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(body["error"], "broker_disabled");
    }

    #[tokio::test]
    async fn test_queue_unknown_destination() {
        let broker = Arc::new(crate::broker::InMemoryBroker::new(["testQueue"], 4));
        let app = test_app(broker);
        let (status, _, _) =
            send(&app, post_json("/test-rest/queues?brokerName=other", "{}")).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_queue_requires_object_and_destination() {
        let broker = Arc::new(RecordingBroker::default());
        let app = test_app(broker.clone());

        let (status, _, _) =
            send(&app, post_json("/test-rest/queues?brokerName=testQueue", "[1, 2]")).await;
        assert!(status.is_client_error());

        let (status, _, _) = send(&app, post_json("/test-rest/queues", "{}")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        assert!(broker.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_health() {
        let app = test_app(Arc::new(DisabledBroker));
        let (status, body, _) = send(&app, get_req("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, r#"{"status":"ok"}"#);
    }
}
