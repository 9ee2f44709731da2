//! Integration tests for the booking REST API.
//!
//! Each test spins up an Axum server on a random port backed by a seeded
//! in-memory directory, and drives the wizard over HTTP with reqwest.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;

use care_booking::booking::{
    BookingId, BookingRequest, BookingRouteState, Payer, Provider, ProviderFilter, SessionRegistry,
    Slot, booking_routes,
};
use care_booking::config::{FlowConfig, SessionConfig};
use care_booking::directory::{BookingDirectory, LibSqlDirectory};
use care_booking::error::DirectoryError;

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

async fn seeded_directory() -> LibSqlDirectory {
    let directory = LibSqlDirectory::new_memory().await.unwrap();
    directory.seed_demo_data().await.unwrap();
    directory
}

/// Start an Axum server on a random port, return (base url, registry).
async fn start_server_with(session: SessionConfig) -> (String, Arc<SessionRegistry>) {
    start_server_over(Arc::new(seeded_directory().await), session).await
}

async fn start_server_over(
    directory: Arc<dyn BookingDirectory>,
    session: SessionConfig,
) -> (String, Arc<SessionRegistry>) {
    let registry = SessionRegistry::new(directory, FlowConfig::default(), session);
    let app = booking_routes(BookingRouteState {
        registry: Arc::clone(&registry),
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    (format!("http://127.0.0.1:{port}"), registry)
}

async fn start_server() -> (String, Arc<SessionRegistry>) {
    start_server_with(SessionConfig::default()).await
}

/// Send a request and return (status, JSON body).
async fn call(
    client: &reqwest::Client,
    method: reqwest::Method,
    url: String,
    body: Option<Value>,
) -> (u16, Value) {
    let mut req = client.request(method, url);
    if let Some(body) = body {
        req = req.json(&body);
    }
    let resp = req.send().await.unwrap();
    let status = resp.status().as_u16();
    let json = resp.json::<Value>().await.unwrap_or(Value::Null);
    (status, json)
}

async fn create_session(client: &reqwest::Client, base: &str) -> String {
    let (status, body) = call(
        client,
        reqwest::Method::POST,
        format!("{base}/api/booking/sessions"),
        None,
    )
    .await;
    assert_eq!(status, 201);
    body["id"].as_str().unwrap().to_string()
}

fn contact() -> Value {
    json!({
        "first_name": "Priya",
        "last_name": "Nair",
        "email": "priya.nair@example.org",
        "phone": "(415) 555-0117",
        "date_of_birth": "1988-11-02"
    })
}

/// Seeded directory whose payer listing or booking call can be made to fail.
struct FlakyDirectory {
    inner: LibSqlDirectory,
    payers_error: Option<fn() -> DirectoryError>,
    booking_error: Option<fn() -> DirectoryError>,
}

impl FlakyDirectory {
    async fn new() -> Self {
        Self {
            inner: seeded_directory().await,
            payers_error: None,
            booking_error: None,
        }
    }
}

#[async_trait]
impl BookingDirectory for FlakyDirectory {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn list_payers(&self) -> Result<Vec<Payer>, DirectoryError> {
        match self.payers_error {
            Some(err) => Err(err()),
            None => self.inner.list_payers().await,
        }
    }

    async fn list_providers(
        &self,
        filter: &ProviderFilter,
    ) -> Result<Vec<Provider>, DirectoryError> {
        self.inner.list_providers(filter).await
    }

    async fn list_slots(
        &self,
        provider_id: &str,
        from: DateTime<Utc>,
    ) -> Result<Vec<Slot>, DirectoryError> {
        self.inner.list_slots(provider_id, from).await
    }

    async fn create_booking(&self, request: &BookingRequest) -> Result<BookingId, DirectoryError> {
        match self.booking_error {
            Some(err) => Err(err()),
            None => self.inner.create_booking(request).await,
        }
    }
}

fn unavailable() -> DirectoryError {
    DirectoryError::BadStatus {
        backend: "flaky".into(),
        status: 503,
        body: "maintenance".into(),
    }
}

fn slot_taken() -> DirectoryError {
    DirectoryError::Conflict("slot is no longer available".into())
}

fn payers_missing() -> DirectoryError {
    DirectoryError::NotFound {
        entity: "table".into(),
        id: "payers".into(),
    }
}

/// Walk a self booking up to the confirm step and return the chosen slot id.
async fn drive_to_confirm(client: &reqwest::Client, base: &str, id: &str) -> String {
    let url = |path: &str| format!("{base}/api/booking/sessions/{id}/{path}");
    call(client, reqwest::Method::POST, url("intent"), Some(json!({"is_for_self": true}))).await;
    call(client, reqwest::Method::PUT, url("contact"), Some(contact())).await;
    call(client, reqwest::Method::POST, url("advance"), None).await;
    call(
        client,
        reqwest::Method::PUT,
        url("payer"),
        Some(json!({"payer_id": "payer-northwind", "member_id": "NW-7781"})),
    )
    .await;
    let (_, body) = call(client, reqwest::Method::POST, url("advance"), None).await;
    let provider_id = body["providers"]["items"][0]["id"].as_str().unwrap().to_string();
    call(
        client,
        reqwest::Method::PUT,
        url("provider"),
        Some(json!({"provider_id": provider_id})),
    )
    .await;
    let (_, body) = call(client, reqwest::Method::POST, url("advance"), None).await;
    let slot_id = body["slots"]["items"][0]["id"].as_str().unwrap().to_string();
    call(client, reqwest::Method::PUT, url("slot"), Some(json!({"slot_id": slot_id}))).await;
    let (status, body) = call(client, reqwest::Method::POST, url("advance"), None).await;
    assert_eq!(status, 200);
    assert_eq!(body["step"], "confirm");
    slot_id
}

// ── Tests ────────────────────────────────────────────────────────────

#[tokio::test]
async fn health_returns_ok() {
    timeout(TEST_TIMEOUT, async {
        let (base, _registry) = start_server().await;
        let resp = reqwest::get(format!("{base}/health")).await.unwrap();
        assert_eq!(resp.status(), 200);
        let json: Value = resp.json().await.unwrap();
        assert_eq!(json["status"], "ok");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn new_session_starts_at_welcome() {
    timeout(TEST_TIMEOUT, async {
        let (base, registry) = start_server().await;
        let client = reqwest::Client::new();
        let id = create_session(&client, &base).await;

        let (status, body) = call(
            &client,
            reqwest::Method::GET,
            format!("{base}/api/booking/sessions/{id}"),
            None,
        )
        .await;
        assert_eq!(status, 200);
        assert_eq!(body["step"], "welcome");
        assert_eq!(body["submitting"], false);
        assert_eq!(body["payers"]["status"], "idle");
        assert_eq!(registry.len().await, 1);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn full_self_booking_over_http() {
    timeout(TEST_TIMEOUT, async {
        let (base, _registry) = start_server().await;
        let client = reqwest::Client::new();
        let id = create_session(&client, &base).await;
        let url = |path: &str| format!("{base}/api/booking/sessions/{id}/{path}");

        let (status, body) = call(
            &client,
            reqwest::Method::POST,
            url("intent"),
            Some(json!({"is_for_self": true})),
        )
        .await;
        assert_eq!(status, 200);
        assert_eq!(body["step"], "identity");

        let (status, _) = call(&client, reqwest::Method::PUT, url("contact"), Some(contact())).await;
        assert_eq!(status, 200);

        let (status, body) = call(&client, reqwest::Method::POST, url("advance"), None).await;
        assert_eq!(status, 200);
        assert_eq!(body["step"], "payer");
        assert_eq!(body["payers"]["status"], "loaded");
        let payer_ids: Vec<&str> = body["payers"]["items"]
            .as_array()
            .unwrap()
            .iter()
            .map(|p| p["id"].as_str().unwrap())
            .collect();
        assert!(payer_ids.contains(&"payer-northwind"));
        assert!(!payer_ids.contains(&"payer-retired"));

        let (status, _) = call(
            &client,
            reqwest::Method::PUT,
            url("payer"),
            Some(json!({"payer_id": "payer-northwind", "member_id": "NW-7781"})),
        )
        .await;
        assert_eq!(status, 200);

        let (_, body) = call(&client, reqwest::Method::POST, url("advance"), None).await;
        assert_eq!(body["step"], "provider");
        let provider_id = body["providers"]["items"][0]["id"]
            .as_str()
            .unwrap()
            .to_string();

        call(
            &client,
            reqwest::Method::PUT,
            url("provider"),
            Some(json!({"provider_id": provider_id})),
        )
        .await;
        let (_, body) = call(&client, reqwest::Method::POST, url("advance"), None).await;
        assert_eq!(body["step"], "slot");
        let slot_id = body["slots"]["items"][0]["id"].as_str().unwrap().to_string();

        let (status, body) = call(
            &client,
            reqwest::Method::PUT,
            url("slot"),
            Some(json!({"slot_id": slot_id})),
        )
        .await;
        assert_eq!(status, 200);
        assert_eq!(body["draft"]["slot"]["id"], slot_id.as_str());

        let (_, body) = call(&client, reqwest::Method::POST, url("advance"), None).await;
        assert_eq!(body["step"], "confirm");

        call(
            &client,
            reqwest::Method::PUT,
            url("reason"),
            Some(json!({"reason": "  Medication review  "})),
        )
        .await;

        let (status, body) = call(&client, reqwest::Method::POST, url("submit"), None).await;
        assert_eq!(status, 200);
        assert_eq!(body["step"], "submitted");
        assert_eq!(body["draft"]["reason"], "Medication review");
        assert!(body["booking_id"].as_str().unwrap().starts_with("bk_"));

        // Finished flows reject further edits.
        let (status, body) = call(&client, reqwest::Method::POST, url("back"), None).await;
        assert_eq!(status, 409);
        assert_eq!(body["error"]["code"], "FLOW_FINISHED");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn incomplete_step_returns_field_errors() {
    timeout(TEST_TIMEOUT, async {
        let (base, _registry) = start_server().await;
        let client = reqwest::Client::new();
        let id = create_session(&client, &base).await;
        let url = |path: &str| format!("{base}/api/booking/sessions/{id}/{path}");

        let (status, body) = call(&client, reqwest::Method::POST, url("advance"), None).await;
        assert_eq!(status, 422);
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
        assert_eq!(body["error"]["fields"][0]["field"], "is_for_self");

        // The failure is also recorded on the session for the UI.
        let (_, snapshot) = call(
            &client,
            reqwest::Method::GET,
            format!("{base}/api/booking/sessions/{id}"),
            None,
        )
        .await;
        assert_eq!(snapshot["step"], "welcome");
        assert_eq!(snapshot["error"]["kind"], "validation");

        call(
            &client,
            reqwest::Method::POST,
            url("intent"),
            Some(json!({"is_for_self": true})),
        )
        .await;
        let mut bad = contact();
        bad["email"] = json!("not-an-email");
        call(&client, reqwest::Method::PUT, url("contact"), Some(bad)).await;

        let (status, body) = call(&client, reqwest::Method::POST, url("advance"), None).await;
        assert_eq!(status, 422);
        let fields: Vec<&str> = body["error"]["fields"]
            .as_array()
            .unwrap()
            .iter()
            .map(|f| f["field"].as_str().unwrap())
            .collect();
        assert_eq!(fields, vec!["contact.email"]);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn setter_on_wrong_step_conflicts() {
    timeout(TEST_TIMEOUT, async {
        let (base, _registry) = start_server().await;
        let client = reqwest::Client::new();
        let id = create_session(&client, &base).await;

        let (status, body) = call(
            &client,
            reqwest::Method::PUT,
            format!("{base}/api/booking/sessions/{id}/payer"),
            Some(json!({"payer_id": "payer-northwind"})),
        )
        .await;
        assert_eq!(status, 409);
        assert_eq!(body["error"]["code"], "WRONG_STEP");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn on_behalf_of_path_includes_patient_step() {
    timeout(TEST_TIMEOUT, async {
        let (base, _registry) = start_server().await;
        let client = reqwest::Client::new();
        let id = create_session(&client, &base).await;
        let url = |path: &str| format!("{base}/api/booking/sessions/{id}/{path}");

        let (_, body) = call(
            &client,
            reqwest::Method::POST,
            url("intent"),
            Some(json!({"is_for_self": false})),
        )
        .await;
        assert_eq!(body["step"], "on_behalf_of");

        call(
            &client,
            reqwest::Method::PUT,
            url("patient"),
            Some(json!({
                "first_name": "Leo",
                "last_name": "Nair",
                "date_of_birth": "2015-06-09",
                "relationship": "child"
            })),
        )
        .await;
        let (status, body) = call(&client, reqwest::Method::POST, url("advance"), None).await;
        assert_eq!(status, 200);
        assert_eq!(body["step"], "identity");

        let (_, body) = call(&client, reqwest::Method::POST, url("back"), None).await;
        assert_eq!(body["step"], "on_behalf_of");
        assert_eq!(body["draft"]["patient"]["first_name"], "Leo");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn abandon_discards_session() {
    timeout(TEST_TIMEOUT, async {
        let (base, registry) = start_server().await;
        let client = reqwest::Client::new();
        let id = create_session(&client, &base).await;
        let session_url = format!("{base}/api/booking/sessions/{id}");

        let (status, body) = call(&client, reqwest::Method::DELETE, session_url.clone(), None).await;
        assert_eq!(status, 200);
        assert_eq!(body["step"], "abandoned");
        assert!(registry.is_empty().await);

        let (status, body) = call(&client, reqwest::Method::GET, session_url, None).await;
        assert_eq!(status, 404);
        assert_eq!(body["error"]["code"], "SESSION_NOT_FOUND");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn malformed_session_id_is_bad_request() {
    timeout(TEST_TIMEOUT, async {
        let (base, _registry) = start_server().await;
        let resp = reqwest::get(format!("{base}/api/booking/sessions/not-a-uuid"))
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        let json: Value = resp.json().await.unwrap();
        assert_eq!(json["error"]["code"], "BAD_REQUEST");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn session_limit_returns_503() {
    timeout(TEST_TIMEOUT, async {
        let (base, _registry) = start_server_with(SessionConfig {
            max_sessions: 1,
            ..SessionConfig::default()
        })
        .await;
        let client = reqwest::Client::new();
        create_session(&client, &base).await;

        let (status, body) = call(
            &client,
            reqwest::Method::POST,
            format!("{base}/api/booking/sessions"),
            None,
        )
        .await;
        assert_eq!(status, 503);
        assert_eq!(body["error"]["code"], "SESSION_LIMIT");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn partial_contact_reports_every_missing_field() {
    timeout(TEST_TIMEOUT, async {
        let (base, _registry) = start_server().await;
        let client = reqwest::Client::new();
        let id = create_session(&client, &base).await;
        let url = |path: &str| format!("{base}/api/booking/sessions/{id}/{path}");

        call(&client, reqwest::Method::POST, url("intent"), Some(json!({"is_for_self": true}))).await;
        let (status, body) = call(
            &client,
            reqwest::Method::PUT,
            url("contact"),
            Some(json!({"first_name": "Priya"})),
        )
        .await;
        assert_eq!(status, 200);
        assert_eq!(body["draft"]["contact"]["first_name"], "Priya");

        let (status, body) = call(&client, reqwest::Method::POST, url("advance"), None).await;
        assert_eq!(status, 422);
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
        let fields: Vec<&str> = body["error"]["fields"]
            .as_array()
            .unwrap()
            .iter()
            .map(|f| f["field"].as_str().unwrap())
            .collect();
        assert_eq!(
            fields,
            vec![
                "contact.last_name",
                "contact.email",
                "contact.phone",
                "contact.date_of_birth"
            ]
        );
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn unreadable_body_uses_error_envelope() {
    timeout(TEST_TIMEOUT, async {
        let (base, _registry) = start_server().await;
        let client = reqwest::Client::new();
        let id = create_session(&client, &base).await;
        let url = format!("{base}/api/booking/sessions/{id}/contact");

        let resp = client
            .put(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(r#"{"first_name":"#)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["code"], "INVALID_BODY");
        assert!(!body["error"]["message"].as_str().unwrap().is_empty());

        let resp = client.put(&url).body("first_name=Priya").send().await.unwrap();
        assert_eq!(resp.status(), 415);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["code"], "INVALID_BODY");

        // Wrong JSON types are rejected the same way.
        let (status, body) = call(
            &client,
            reqwest::Method::POST,
            format!("{base}/api/booking/sessions/{id}/intent"),
            Some(json!({"is_for_self": "yes"})),
        )
        .await;
        assert_eq!(status, 422);
        assert_eq!(body["error"]["code"], "INVALID_BODY");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn transient_submit_failure_keeps_confirm_step() {
    timeout(TEST_TIMEOUT, async {
        let mut directory = FlakyDirectory::new().await;
        directory.booking_error = Some(unavailable);
        let (base, _registry) = start_server_over(Arc::new(directory), SessionConfig::default()).await;
        let client = reqwest::Client::new();
        let id = create_session(&client, &base).await;
        let slot_id = drive_to_confirm(&client, &base, &id).await;

        let (status, body) = call(
            &client,
            reqwest::Method::POST,
            format!("{base}/api/booking/sessions/{id}/submit"),
            None,
        )
        .await;
        assert_eq!(status, 502);
        assert_eq!(body["error"]["code"], "SUBMISSION_FAILED");
        assert_eq!(body["error"]["retryable"], true);

        let (status, snapshot) = call(
            &client,
            reqwest::Method::GET,
            format!("{base}/api/booking/sessions/{id}"),
            None,
        )
        .await;
        assert_eq!(status, 200);
        assert_eq!(snapshot["step"], "confirm");
        assert_eq!(snapshot["submitting"], false);
        assert_eq!(snapshot["draft"]["slot"]["id"], slot_id.as_str());
        assert_eq!(snapshot["draft"]["payer_id"], "payer-northwind");
        assert_eq!(snapshot["draft"]["contact"]["email"], "priya.nair@example.org");
        assert_eq!(snapshot["error"]["kind"], "submission");
        assert_eq!(snapshot["error"]["retryable"], true);
        assert!(snapshot.get("booking_id").is_none());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn rejected_submit_is_conflict_and_not_retryable() {
    timeout(TEST_TIMEOUT, async {
        let mut directory = FlakyDirectory::new().await;
        directory.booking_error = Some(slot_taken);
        let (base, _registry) = start_server_over(Arc::new(directory), SessionConfig::default()).await;
        let client = reqwest::Client::new();
        let id = create_session(&client, &base).await;
        let slot_id = drive_to_confirm(&client, &base, &id).await;

        let (status, body) = call(
            &client,
            reqwest::Method::POST,
            format!("{base}/api/booking/sessions/{id}/submit"),
            None,
        )
        .await;
        assert_eq!(status, 409);
        assert_eq!(body["error"]["code"], "SUBMISSION_REJECTED");
        assert_eq!(body["error"]["retryable"], false);

        let (_, snapshot) = call(
            &client,
            reqwest::Method::GET,
            format!("{base}/api/booking/sessions/{id}"),
            None,
        )
        .await;
        assert_eq!(snapshot["step"], "confirm");
        assert_eq!(snapshot["draft"]["slot"]["id"], slot_id.as_str());
        assert_eq!(snapshot["error"]["kind"], "submission");
        assert_eq!(snapshot["error"]["retryable"], false);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn failed_payer_load_reports_fetch_error() {
    timeout(TEST_TIMEOUT, async {
        let mut directory = FlakyDirectory::new().await;
        directory.payers_error = Some(payers_missing);
        let (base, _registry) = start_server_over(Arc::new(directory), SessionConfig::default()).await;
        let client = reqwest::Client::new();
        let id = create_session(&client, &base).await;
        let url = |path: &str| format!("{base}/api/booking/sessions/{id}/{path}");

        call(&client, reqwest::Method::POST, url("intent"), Some(json!({"is_for_self": true}))).await;
        call(&client, reqwest::Method::PUT, url("contact"), Some(contact())).await;

        // The advance lands even though the list behind it failed.
        let (status, body) = call(&client, reqwest::Method::POST, url("advance"), None).await;
        assert_eq!(status, 200);
        assert_eq!(body["step"], "payer");
        assert_eq!(body["payers"]["status"], "failed");
        assert_eq!(body["payers"]["retryable"], false);
        assert_eq!(body["error"]["kind"], "fetch");

        let (status, body) = call(&client, reqwest::Method::POST, url("load"), None).await;
        assert_eq!(status, 502);
        assert_eq!(body["error"]["code"], "FETCH_FAILED");
        assert_eq!(body["error"]["retryable"], false);

        let (_, snapshot) = call(
            &client,
            reqwest::Method::GET,
            format!("{base}/api/booking/sessions/{id}"),
            None,
        )
        .await;
        assert_eq!(snapshot["step"], "payer");
        assert_eq!(snapshot["draft"]["contact"]["first_name"], "Priya");
    })
    .await
    .expect("test timed out");
}
