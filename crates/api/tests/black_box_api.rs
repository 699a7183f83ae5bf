use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{Value, json};

use conreg_api::app::{AppState, build_app};
use conreg_core::{TicketId, TierId, UserId};
use conreg_infra::queue::{InMemoryQueue, JobQueue, QueueError, QueueMessage};
use conreg_infra::repository::InMemoryTicketRepository;
use conreg_tickets::{TicketTier, User};

const KEY: &str = "black-box-key";

struct TestServer {
    base_url: String,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn(state: AppState) -> Self {
        // Same router as prod, bound to an ephemeral port.
        let app = build_app(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { base_url, handle }
    }

    async fn post(&self, path: &str, body: Value) -> (StatusCode, Value) {
        let res = reqwest::Client::new()
            .post(format!("{}{}", self.base_url, path))
            .header("X-Internal-Api-Key", KEY)
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = res.status();
        (status, res.json().await.unwrap_or(Value::Null))
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

struct Fixture {
    repo: Arc<InMemoryTicketRepository>,
    attendee: UserId,
    staff: UserId,
    standard: TierId,
    vip: TierId,
}

async fn fixture() -> Fixture {
    let repo = Arc::new(InMemoryTicketRepository::new());
    let tier = |code: &str, stock, price| TicketTier {
        id: TierId::new(),
        code: code.to_string(),
        stock,
        price,
        is_active: true,
        is_deleted: false,
    };
    let standard = tier("STD", 10, 5000);
    let vip = tier("VIP", 2, 15000);
    repo.insert_tier(standard.clone()).await;
    repo.insert_tier(vip.clone()).await;

    let attendee = UserId::new();
    let staff = UserId::new();
    repo.insert_user(User::new(attendee)).await;
    repo.insert_user(User::new(staff)).await;

    Fixture { repo, attendee, staff, standard: standard.id, vip: vip.id }
}

fn state(repo: Arc<InMemoryTicketRepository>, queue: Arc<dyn JobQueue>) -> AppState {
    AppState::new(repo, queue, Duration::from_secs(5)).with_internal_api_key(Some(KEY.to_string()))
}

#[tokio::test]
async fn health_is_public() {
    let f = fixture().await;
    let srv = TestServer::spawn(state(f.repo, Arc::new(InMemoryQueue::default()))).await;

    let res = reqwest::get(format!("{}/health", srv.base_url)).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn internal_routes_require_the_key() {
    let f = fixture().await;
    let srv = TestServer::spawn(state(f.repo, Arc::new(InMemoryQueue::default()))).await;

    let res = reqwest::Client::new()
        .post(format!("{}/internal/jobs", srv.base_url))
        .json(&json!({ "action": "cancel", "user_id": f.attendee.to_string() }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn ticket_lifecycle_over_http() {
    let f = fixture().await;
    let srv = TestServer::spawn(state(f.repo.clone(), Arc::new(InMemoryQueue::default()))).await;
    let user = f.attendee.to_string();

    let (status, body) = srv
        .post("/internal/jobs", json!({ "action": "purchase", "user_id": user, "tier_id": f.standard.to_string() }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"]["reference_code"], "STD-0001");
    assert_eq!(body["result"]["status"], "pending");

    let (status, body) = srv
        .post("/internal/jobs", json!({ "action": "confirm_payment", "user_id": user }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"]["status"], "self_confirmed");

    let (status, body) = srv
        .post("/internal/jobs", json!({ "action": "upgrade_ticket", "user_id": user, "tier_id": f.vip.to_string() }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"]["reference_code"], "VIP-0001");
    assert_eq!(body["result"]["previous_reference_code"], "STD-0001");
    let ticket_id = body["result"]["id"].as_str().unwrap().to_string();

    let approve = json!({ "action": "approve", "ticket_id": ticket_id, "staff_id": f.staff.to_string() });
    let (status, body) = srv.post("/internal/jobs", approve.clone()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["changed"], true);
    let (_, body) = srv.post("/internal/jobs", approve).await;
    assert_eq!(body["changed"], false);

    let (status, body) = srv
        .post(
            "/internal/jobs",
            json!({
                "action": "update_badge",
                "user_id": user,
                "con_badge_name": "Nightfox",
                "is_fursuiter": true
            }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"]["con_badge_name"], "Nightfox");

    let (status, body) = srv.post("/internal/jobs", json!({ "action": "cancel", "user_id": user })).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "invalid_ticket_status");

    assert_eq!(f.repo.tier(f.standard).await.unwrap().stock, 10);
    assert_eq!(f.repo.tier(f.vip).await.unwrap().stock, 1);
}

#[tokio::test]
async fn error_bodies_carry_codes() {
    let f = fixture().await;
    let srv = TestServer::spawn(state(f.repo.clone(), Arc::new(InMemoryQueue::default()))).await;

    let (status, body) = srv.post("/internal/jobs", json!({ "action": "purchase", "user_id": "nope" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_identifier");

    let (status, body) = srv
        .post(
            "/internal/jobs",
            json!({
                "action": "deny",
                "ticket_id": TicketId::new().to_string(),
                "staff_id": f.staff.to_string(),
                "reason": "duplicate"
            }),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "ticket_not_found");

    srv.post("/internal/jobs", json!({ "action": "blacklist_user", "target_user_id": f.attendee.to_string() }))
        .await;
    let (status, body) = srv
        .post(
            "/internal/jobs",
            json!({ "action": "purchase", "user_id": f.attendee.to_string(), "tier_id": f.standard.to_string() }),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "user_blacklisted");
}

#[tokio::test]
async fn enqueue_reaches_the_queue() {
    let f = fixture().await;
    let queue = Arc::new(InMemoryQueue::default());
    let srv = TestServer::spawn(state(f.repo, queue.clone())).await;

    let (status, body) = srv
        .post("/jobs", json!({ "action": "cancel", "user_id": f.attendee.to_string() }))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["action"], "cancel");

    let received = queue.receive(10, Duration::ZERO).await.unwrap();
    assert_eq!(received.len(), 1);
    let sent: Value = serde_json::from_slice(&received[0].body).unwrap();
    assert_eq!(sent["action"], "cancel");
}

/// Queue whose broker is down.
struct Unreachable;

#[async_trait]
impl JobQueue for Unreachable {
    async fn send(&self, _body: &[u8]) -> Result<String, QueueError> {
        Err(QueueError::Connection("connection refused".to_string()))
    }
    async fn receive(&self, _max: usize, _wait: Duration) -> Result<Vec<QueueMessage>, QueueError> {
        Err(QueueError::Connection("connection refused".to_string()))
    }
    async fn delete(&self, _message: &QueueMessage) -> Result<(), QueueError> {
        Ok(())
    }
    async fn dead_letter(&self, _message: &QueueMessage, _error: &str) -> Result<(), QueueError> {
        Ok(())
    }
}

#[tokio::test]
async fn enqueue_with_broker_down_is_unavailable() {
    let f = fixture().await;
    let srv = TestServer::spawn(state(f.repo, Arc::new(Unreachable))).await;

    let (status, body) = srv
        .post("/jobs", json!({ "action": "cancel", "user_id": f.attendee.to_string() }))
        .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "queue_unavailable");
}
