use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use larder_ai::{ExtractedItem, ImageAnalysis, LocalInference};
use larder_api::app::services::AppServices;
use larder_auth::{JwtClaims, Role};
use larder_core::OwnerId;
use larder_infra::jobs::{InMemoryQueueStore, QueueName, QueueStore, WorkerConfig};
use reqwest::StatusCode;
use serde_json::{json, Value};

const JWT_SECRET: &str = "test-secret";

struct TestServer {
    base_url: String,
    handle: tokio::task::JoinHandle<()>,
    services: Arc<AppServices>,
}

impl TestServer {
    async fn spawn() -> Self {
        Self::spawn_with(true, Duration::from_secs(5)).await
    }

    /// Same router as prod, in-memory services, bound to an ephemeral port.
    async fn spawn_with(start_workers: bool, wait_timeout: Duration) -> Self {
        let inference = LocalInference::new().with_default_analysis(ImageAnalysis {
            raw_text: "MILK 1L\nEGGS x12".into(),
            items: vec![
                ExtractedItem::new("Milk", 1.2, "l").with_confidence(0.93),
                ExtractedItem::new("Eggs", 12.0, ""),
            ],
        });
        let services = Arc::new(
            AppServices::in_memory(Arc::new(InMemoryQueueStore::new()), Arc::new(inference))
                .with_wait_timeout(wait_timeout),
        );
        if start_workers {
            services.start_workers(
                &WorkerConfig::default()
                    .with_poll_interval(Duration::from_millis(10))
                    .with_sweep_interval(Duration::from_millis(100)),
            );
        }

        let app = larder_api::app::build_app(JWT_SECRET, services.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            handle,
            services,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn mint_jwt(owner: OwnerId, roles: Vec<Role>) -> String {
    let now = Utc::now();
    let claims = JwtClaims {
        sub: owner,
        roles,
        issued_at: now - ChronoDuration::seconds(5),
        expires_at: now + ChronoDuration::minutes(10),
    };

    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .expect("failed to encode jwt")
}

async fn status_eventually(client: &reqwest::Client, srv: &TestServer, token: &str, queue: &str, job_id: &str) -> Value {
    // Workers run in the background; poll until the job is terminal.
    for _ in 0..200 {
        let res = client
            .get(srv.url(&format!("/jobs/{queue}/{job_id}")))
            .bearer_auth(token)
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let body: Value = res.json().await.unwrap();
        if body["status"] == "completed" || body["status"] == "failed" {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    panic!("job {job_id} did not finish within timeout");
}

async fn enqueue(client: &reqwest::Client, srv: &TestServer, token: &str, queue: &str, body: Value) -> String {
    let res = client
        .post(srv.url(&format!("/jobs/{queue}")))
        .bearer_auth(token)
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let body: Value = res.json().await.unwrap();
    body["job_id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn auth_required_for_protected_endpoints() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client.get(srv.url("/whoami")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "unauthenticated");

    let res = client
        .get(srv.url("/whoami"))
        .bearer_auth("not-a-jwt")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn owner_is_derived_from_token() {
    let srv = TestServer::spawn().await;
    let owner = OwnerId::new();
    let token = mint_jwt(owner, vec![Role::new("admin")]);

    let res = reqwest::Client::new()
        .get(srv.url("/whoami"))
        .bearer_auth(token)
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["owner_id"].as_str().unwrap(), owner.to_string());
    assert!(body["roles"].as_array().unwrap().iter().any(|r| r == "admin"));
}

#[tokio::test]
async fn audit_job_runs_to_completion() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let token = mint_jwt(OwnerId::new(), vec![]);

    let job_id = enqueue(&client, &srv, &token, "audit-logging", json!({"action": "LOGIN", "details": {"ip": "127.0.0.1"}})).await;
    let status = status_eventually(&client, &srv, &token, "audit-logging", &job_id).await;

    assert_eq!(status["status"], "completed");
    assert!(status["result"]["entry_id"].is_string());
    assert!(status["error"].is_null());
}

#[tokio::test]
async fn invalid_payloads_and_unknown_queues_are_rejected() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let token = mint_jwt(OwnerId::new(), vec![]);

    let res = client
        .post(srv.url("/jobs/ai-analysis"))
        .bearer_auth(&token)
        .json(&json!({"action": "GENERATE_INSIGHTS", "query": ""}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "validation_error");

    let res = client
        .post(srv.url("/jobs/email"))
        .bearer_auth(&token)
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let counts = srv.services.queue.get_counts(QueueName::AiAnalysis).await.unwrap();
    assert_eq!(counts.total(), 0);
}

#[tokio::test]
async fn status_is_private_to_the_job_owner() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let owner = mint_jwt(OwnerId::new(), vec![]);
    let stranger = mint_jwt(OwnerId::new(), vec![Role::new("admin")]);

    let job_id = enqueue(&client, &srv, &owner, "audit-logging", json!({"action": "LOGIN"})).await;

    let res = client
        .get(srv.url(&format!("/jobs/audit-logging/{job_id}")))
        .bearer_auth(&stranger)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);

    let res = client
        .get(srv.url(&format!("/jobs/audit-logging/{}", larder_core::JobId::new())))
        .bearer_auth(&owner)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = client
        .get(srv.url("/jobs/audit-logging/not-a-uuid"))
        .bearer_auth(&owner)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn image_scan_produces_reviewable_items() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let token = mint_jwt(OwnerId::new(), vec![]);

    let res = client
        .post(srv.url("/inventories"))
        .bearer_auth(&token)
        .json(&json!({"name": "Fridge"}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let inventory: Value = res.json().await.unwrap();
    let inventory_id = inventory["id"].as_str().unwrap().to_string();

    let res = client
        .post(srv.url(&format!("/inventories/{inventory_id}/items/from-image")))
        .bearer_auth(&token)
        .header("content-type", "image/jpeg")
        .body(vec![0xFF, 0xD8, 0xFF, 0xE0])
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let accepted: Value = res.json().await.unwrap();
    let job_id = accepted["job_id"].as_str().unwrap().to_string();

    let status = status_eventually(&client, &srv, &token, "image-processing", &job_id).await;
    assert_eq!(status["status"], "completed");
    assert_eq!(status["owner_context"], inventory_id.as_str());
    let items = status["result"]["items"].as_array().unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0]["quantity"], 1.0);
    assert_eq!(items[1]["unit"], "pcs");

    // Nothing is added until the reviewed items are written back.
    let res = client
        .get(srv.url(&format!("/inventories/{inventory_id}/items")))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    let listed: Value = res.json().await.unwrap();
    assert_eq!(listed.as_array().unwrap().len(), 0);

    let res = client
        .post(srv.url(&format!("/inventories/{inventory_id}/items")))
        .bearer_auth(&token)
        .json(&json!({"name": "Milk", "quantity": 1.0, "unit": "l", "notes": "Added via OCR Scan (93% conf)"}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn image_scan_requires_an_owned_inventory_and_an_image() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let token = mint_jwt(OwnerId::new(), vec![]);

    let res = client
        .post(srv.url(&format!("/inventories/{}/items/from-image", larder_core::InventoryId::new())))
        .bearer_auth(&token)
        .header("content-type", "image/png")
        .body(vec![1, 2, 3])
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = client
        .post(srv.url("/inventories"))
        .bearer_auth(&token)
        .json(&json!({"name": "Pantry"}))
        .send()
        .await
        .unwrap();
    let inventory: Value = res.json().await.unwrap();
    let res = client
        .post(srv.url(&format!("/inventories/{}/items/from-image", inventory["id"].as_str().unwrap())))
        .bearer_auth(&token)
        .header("content-type", "text/plain")
        .body("hello")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn waste_prediction_waits_for_the_job() {
    let srv = TestServer::spawn().await;
    let token = mint_jwt(OwnerId::new(), vec![]);

    let res = reqwest::Client::new()
        .post(srv.url("/intelligence/waste-prediction"))
        .bearer_auth(&token)
        .json(&json!({"data": [{"name": "spinach", "days_left": 1}]}))
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["prediction"]["action"], "ANALYZE_WASTE");
    assert!(body["prediction"]["response"].is_string());
}

#[tokio::test]
async fn waste_prediction_times_out_with_504() {
    let srv = TestServer::spawn_with(false, Duration::from_millis(300)).await;
    let token = mint_jwt(OwnerId::new(), vec![]);

    let res = reqwest::Client::new()
        .post(srv.url("/intelligence/waste-prediction"))
        .bearer_auth(&token)
        .json(&json!({"data": {"items": []}}))
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::GATEWAY_TIMEOUT);
    let counts = srv.services.queue.get_counts(QueueName::AiAnalysis).await.unwrap();
    assert_eq!(counts.waiting, 1);
}

#[tokio::test]
async fn obliterate_requires_admin() {
    let srv = TestServer::spawn_with(false, Duration::from_secs(1)).await;
    let client = reqwest::Client::new();
    let user = mint_jwt(OwnerId::new(), vec![]);
    let admin = mint_jwt(OwnerId::new(), vec![Role::new("admin")]);

    enqueue(&client, &srv, &user, "audit-logging", json!({"action": "A"})).await;
    enqueue(&client, &srv, &user, "audit-logging", json!({"action": "B"})).await;

    let res = client
        .delete(srv.url("/admin/queues/audit-logging"))
        .bearer_auth(&user)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);

    let res = client
        .delete(srv.url("/admin/queues/audit-logging"))
        .bearer_auth(&admin)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["removed"], 2);
}

#[tokio::test]
async fn unknown_lanes_are_404_on_every_route() {
    let srv = TestServer::spawn_with(false, Duration::from_secs(1)).await;
    let client = reqwest::Client::new();
    let admin = mint_jwt(OwnerId::new(), vec![Role::new("admin")]);

    let res = client
        .delete(srv.url("/admin/queues/email"))
        .bearer_auth(&admin)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "unknown_queue");

    let res = client
        .get(srv.url(&format!("/jobs/email/{}", larder_core::JobId::new())))
        .bearer_auth(&admin)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "unknown_queue");
}

#[tokio::test]
async fn system_health_reports_every_lane() {
    let srv = TestServer::spawn().await;

    let res = reqwest::Client::new()
        .get(srv.url("/system/health"))
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    let queues = body["queues"].as_array().unwrap();
    assert_eq!(queues.len(), 3);
    assert!(queues.iter().any(|q| q["queue"] == "image-processing"));
}
