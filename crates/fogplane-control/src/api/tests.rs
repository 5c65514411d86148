//! Integration tests for the control plane REST API.
//!
//! Tests use `tower::ServiceExt::oneshot()` to drive the axum router in-process
//! over a fresh in-memory store.

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    response::Response,
    Router,
};
use fogplane_telemetry::MetricsRegistry;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use crate::config::ControlConfig;
use crate::db::MemoryStore;
use crate::services::{ApplicationManifest, Caller, Services};

// ---------------------------------------------------------------------------
// Test harness
// ---------------------------------------------------------------------------

fn make_services() -> Services {
    Services::new(
        Arc::new(MemoryStore::new()),
        ControlConfig::default(),
        Arc::new(MetricsRegistry::new()),
    )
}

fn make_app(services: &Services) -> Router {
    crate::api::create_router(services.clone())
}

/// Send one request through the router and return the status + body bytes.
async fn send(app: Router, req: Request<Body>) -> (StatusCode, bytes::Bytes) {
    let resp: Response = app.oneshot(req).await.expect("router returned error");
    let status = resp.status();
    let body = resp
        .into_body()
        .collect()
        .await
        .expect("body collect failed")
        .to_bytes();
    (status, body)
}

/// Parse body bytes as JSON.
fn json_body(body: &bytes::Bytes) -> Value {
    serde_json::from_slice(body).expect("response is not valid JSON")
}

/// Build a JSON request.
fn json_req(method: Method, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap()
}

/// Build a request with no body.
fn empty_req(method: Method, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

/// Register an agent and return its uuid.
async fn register_agent(app: &Router, name: &str, host: &str) -> String {
    let (status, body) = send(
        app.clone(),
        json_req(Method::POST, "/agents", json!({"name": name, "host": host})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    json_body(&body)["uuid"].as_str().unwrap().to_string()
}

fn microservice(app: &str, name: &str, agent: &str) -> Value {
    json!({
        "name": name,
        "application": app,
        "iofogUuid": agent,
        "images": [{"fogTypeId": 1, "containerImage": "nginx:1.27"}]
    })
}

// ---------------------------------------------------------------------------
// Health and metrics
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_check_returns_200() {
    let services = make_services();
    let (status, body) = send(make_app(&services), empty_req(Method::GET, "/health")).await;
    assert_eq!(status, StatusCode::OK);
    let j = json_body(&body);
    assert_eq!(j["status"], "healthy");
    assert!(j["version"].is_string());
}

#[tokio::test]
async fn metrics_are_exposed_in_prometheus_format() {
    let services = make_services();
    let app = make_app(&services);
    register_agent(&app, "agent1", "10.0.0.1").await;

    let resp = app
        .oneshot(empty_req(Method::GET, "/metrics"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/plain"));
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("fogplane_operations_total"));
    assert!(text.contains("register_agent"));
}

// ---------------------------------------------------------------------------
// Applications
// ---------------------------------------------------------------------------

#[tokio::test]
async fn application_with_two_microservices_and_a_route() {
    let services = make_services();
    let app = make_app(&services);
    let agent = register_agent(&app, "agent1", "10.0.0.1").await;

    let manifest = json!({
        "name": "app1",
        "microservices": [
            microservice("app1", "msA", &agent),
            microservice("app1", "msB", &agent)
        ],
        "routes": [{"name": "a-to-b", "from": "msA", "to": "msB"}]
    });
    let (status, body) = send(
        app.clone(),
        json_req(Method::POST, "/applications", manifest),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let j = json_body(&body);
    assert_eq!(j["name"], "app1");
    assert_eq!(j["microservices"].as_array().unwrap().len(), 2);
    assert_eq!(j["routes"][0]["name"], "a-to-b");

    let (status, body) = send(app, empty_req(Method::GET, "/routes/app1/a-to-b")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json_body(&body)["name"], "a-to-b");
}

#[tokio::test]
async fn duplicate_application_returns_409() {
    let services = make_services();
    let app = make_app(&services);
    let (status, _) = send(
        app.clone(),
        json_req(Method::POST, "/applications", json!({"name": "app1"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = send(
        app,
        json_req(Method::POST, "/applications", json!({"name": "app1"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json_body(&body)["type"], "urn:fogplane:error:conflict");
}

#[tokio::test]
async fn system_applications_are_invisible_over_rest() {
    let services = make_services();
    services
        .applications()
        .create(ApplicationManifest::named("system-app").system(), Caller::Cli)
        .await
        .unwrap();
    let app = make_app(&services);

    let (status, body) = send(
        app.clone(),
        empty_req(Method::GET, "/applications/system-app"),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json_body(&body)["status"], 404);

    let (_, body) = send(app, empty_req(Method::GET, "/applications")).await;
    assert!(json_body(&body).as_array().unwrap().is_empty());
}

#[tokio::test]
async fn patch_and_delete_application() {
    let services = make_services();
    let app = make_app(&services);
    send(
        app.clone(),
        json_req(Method::POST, "/applications", json!({"name": "app1"})),
    )
    .await;

    let (status, body) = send(
        app.clone(),
        json_req(
            Method::PATCH,
            "/applications/app1",
            json!({"isActivated": false, "description": "paused"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let j = json_body(&body);
    assert_eq!(j["isActivated"], false);
    assert_eq!(j["description"], "paused");

    let (status, _) = send(app.clone(), empty_req(Method::DELETE, "/applications/app1")).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send(app, empty_req(Method::GET, "/applications/app1")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ---------------------------------------------------------------------------
// Microservices
// ---------------------------------------------------------------------------

#[tokio::test]
async fn microservice_lifecycle() {
    let services = make_services();
    let app = make_app(&services);
    let agent = register_agent(&app, "agent1", "10.0.0.1").await;
    send(
        app.clone(),
        json_req(Method::POST, "/applications", json!({"name": "app1"})),
    )
    .await;

    let mut body = microservice("app1", "web", &agent);
    body["ports"] = json!([{"internal": 80, "external": 8080, "publicMode": "public"}]);
    let (status, created) = send(
        app.clone(),
        json_req(Method::POST, "/microservices", body),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let created = json_body(&created);
    assert_eq!(created["publicPorts"][0]["link"], "http://10.0.0.1:6000");
    let uuid = created["uuid"].as_str().unwrap().to_string();

    let (status, body) = send(
        app.clone(),
        json_req(
            Method::PATCH,
            &format!("/microservices/{uuid}"),
            json!({"env": [{"key": "MODE", "value": "edge"}]}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let j = json_body(&body);
    assert_eq!(j["rebuild"], true);
    assert_eq!(j["env"][0]["key"], "MODE");
    assert_eq!(j["status"]["status"], "QUEUED");

    let (_, body) = send(
        app.clone(),
        empty_req(Method::GET, "/microservices?application=app1"),
    )
    .await;
    assert_eq!(json_body(&body).as_array().unwrap().len(), 1);

    let (status, _) = send(
        app.clone(),
        empty_req(Method::DELETE, &format!("/microservices/{uuid}")),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    // soft-deleted: exists, but is no longer available
    let (status, body) = send(app, empty_req(Method::GET, &format!("/microservices/{uuid}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(json_body(&body)["detail"]
        .as_str()
        .unwrap()
        .contains("not available"));
}

#[tokio::test]
async fn invalid_volume_name_returns_400() {
    let services = make_services();
    let app = make_app(&services);
    let agent = register_agent(&app, "agent1", "10.0.0.1").await;
    send(
        app.clone(),
        json_req(Method::POST, "/applications", json!({"name": "app1"})),
    )
    .await;

    let mut body = microservice("app1", "store", &agent);
    body["volumeMappings"] = json!([{
        "hostDestination": "my volume!",
        "containerDestination": "/data",
        "type": "volume"
    }]);
    let (status, body) = send(app, json_req(Method::POST, "/microservices", body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json_body(&body)["type"], "urn:fogplane:error:bad-request");
}

#[tokio::test]
async fn unknown_microservice_returns_404() {
    let services = make_services();
    let (status, body) = send(
        make_app(&services),
        empty_req(
            Method::GET,
            "/microservices/00000000-0000-0000-0000-000000000000",
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(json_body(&body)["detail"]
        .as_str()
        .unwrap()
        .contains("not found"));
}

#[tokio::test]
async fn status_report_sweeps_deleted_microservices() {
    let services = make_services();
    let app = make_app(&services);
    let agent = register_agent(&app, "agent1", "10.0.0.1").await;
    send(
        app.clone(),
        json_req(Method::POST, "/applications", json!({"name": "app1"})),
    )
    .await;
    let (_, created) = send(
        app.clone(),
        json_req(Method::POST, "/microservices", microservice("app1", "m1", &agent)),
    )
    .await;
    let uuid = json_body(&created)["uuid"].as_str().unwrap().to_string();
    send(
        app.clone(),
        empty_req(Method::DELETE, &format!("/microservices/{uuid}")),
    )
    .await;

    let (status, _) = send(
        app,
        json_req(
            Method::PUT,
            &format!("/microservices/{uuid}/status"),
            json!({"status": "DELETING"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let mut tx = services.store().begin().await.unwrap();
    let parsed = uuid::Uuid::parse_str(&uuid).unwrap();
    assert!(tx.find_microservice(parsed).await.unwrap().is_none());
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn duplicate_route_returns_409() {
    let services = make_services();
    let app = make_app(&services);
    let agent = register_agent(&app, "agent1", "10.0.0.1").await;
    let manifest = json!({
        "name": "app1",
        "microservices": [
            microservice("app1", "a", &agent),
            microservice("app1", "b", &agent)
        ]
    });
    send(app.clone(), json_req(Method::POST, "/applications", manifest)).await;

    let route = json!({"name": "r1", "application": "app1", "from": "a", "to": "b"});
    let (status, _) = send(app.clone(), json_req(Method::POST, "/routes", route)).await;
    assert_eq!(status, StatusCode::CREATED);

    let again = json!({"name": "r2", "application": "app1", "from": "a", "to": "b"});
    let (status, _) = send(app.clone(), json_req(Method::POST, "/routes", again)).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = send(app.clone(), empty_req(Method::DELETE, "/routes/app1/r1")).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (_, body) = send(app, empty_req(Method::GET, "/routes?application=app1")).await;
    assert!(json_body(&body).as_array().unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Agents and catalog
// ---------------------------------------------------------------------------

#[tokio::test]
async fn agent_changes_can_be_read_and_acknowledged() {
    let services = make_services();
    let app = make_app(&services);
    let agent = register_agent(&app, "agent1", "10.0.0.1").await;
    send(
        app.clone(),
        json_req(Method::POST, "/applications", json!({"name": "app1"})),
    )
    .await;
    send(
        app.clone(),
        json_req(Method::POST, "/microservices", microservice("app1", "m1", &agent)),
    )
    .await;

    let (status, body) = send(
        app.clone(),
        empty_req(Method::GET, &format!("/agents/{agent}/changes")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let entries = json_body(&body)["entries"].as_array().unwrap().clone();
    assert!(entries
        .iter()
        .any(|e| e["flag"] == "microservice_list" && e["pending"] == true));

    let (status, body) = send(
        app,
        empty_req(Method::DELETE, &format!("/agents/{agent}/changes")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(json_body(&body)["cleared"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn agent_host_update_is_returned() {
    let services = make_services();
    let app = make_app(&services);
    let agent = register_agent(&app, "agent1", "10.0.0.1").await;
    let (status, body) = send(
        app,
        json_req(
            Method::PATCH,
            &format!("/agents/{agent}"),
            json!({"host": "10.0.0.42"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json_body(&body)["host"], "10.0.0.42");
}

#[tokio::test]
async fn catalog_items_and_registries() {
    let services = make_services();
    let app = make_app(&services);
    let (status, body) = send(
        app.clone(),
        json_req(
            Method::POST,
            "/catalog",
            json!({
                "name": "web",
                "images": [{"fogTypeId": 1, "containerImage": "nginx:1.27"}]
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = json_body(&body)["id"].as_i64().unwrap();

    let (status, body) = send(app.clone(), empty_req(Method::GET, &format!("/catalog/{id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json_body(&body)["category"], "USER");

    let (status, _) = send(
        app,
        json_req(
            Method::POST,
            "/registries",
            json!({"url": "registry.example.com"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn events_limit_is_bounded() {
    let services = make_services();
    let app = make_app(&services);
    register_agent(&app, "agent1", "10.0.0.1").await;

    let (status, body) = send(app.clone(), empty_req(Method::GET, "/events?limit=10")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json_body(&body)[0]["resourceKind"], "agent");

    let (status, _) = send(app, empty_req(Method::GET, "/events?limit=0")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
