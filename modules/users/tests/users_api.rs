use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::Router;
use http::{header, Request, StatusCode};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use appkit::{
    async_trait, AppConfig, Application, BootstrapError, Event, EventHandler, RegistryError,
    RunningApplication,
};
use users::{UserCreated, UserDeleted, UsersDirectory, UsersModule, USERS_DIRECTORY};

const TOKEN: &str = "t0ken";

fn config() -> AppConfig {
    let mut config = AppConfig::default();
    config.server.port = 0;
    config.auth.tokens = HashMap::from([(TOKEN.to_string(), "admin".to_string())]);
    config
}

async fn start(config: AppConfig) -> RunningApplication {
    let mut app = Application::new(config);
    app.register(Arc::new(UsersModule::default())).unwrap();
    app.start().await.unwrap()
}

async fn call(router: Router, req: Request<Body>) -> (StatusCode, Value) {
    let res = router.oneshot(req).await.unwrap();
    let status = res.status();
    let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, json)
}

fn post_user(body: Value) -> Request<Body> {
    Request::post("/users")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<String>>,
}

#[async_trait]
impl EventHandler for Recorder {
    fn name(&self) -> &str {
        "test.recorder"
    }

    fn event_types(&self) -> &[&'static str] {
        &["user.created", "user.deleted"]
    }

    async fn handle(&self, _cancel: &CancellationToken, event: &Event) -> anyhow::Result<()> {
        let line = if let Ok(created) = event.payload::<UserCreated>() {
            format!("created:{}", created.user.email)
        } else {
            let deleted = event.payload::<UserDeleted>()?;
            format!("deleted:{}:{}", deleted.email, deleted.deleted_by)
        };
        self.seen.lock().push(line);
        Ok(())
    }
}

async fn wait_for(recorder: &Recorder, n: usize) -> Vec<String> {
    for _ in 0..100 {
        if recorder.seen.lock().len() >= n {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    recorder.seen.lock().clone()
}

#[tokio::test]
async fn plans_are_seeded() {
    let running = start(config()).await;
    let (status, body) = call(
        running.router(),
        Request::get("/users/plans").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["name"], "free");
    assert_eq!(body[1]["name"], "pro");
    running.shutdown().await;
}

#[tokio::test]
async fn create_list_and_delete() {
    let running = start(config()).await;
    let recorder = Arc::new(Recorder::default());
    running.events().subscribe_all(recorder.clone()).unwrap();

    let (status, created) = call(
        running.router(),
        post_user(json!({ "email": "ada@example.com", "display_name": "Ada" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["plan"], "free");
    let id = created["id"].as_str().unwrap().to_string();

    let (status, list) = call(
        running.router(),
        Request::get("/users").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list.as_array().unwrap().len(), 1);

    let (status, _) = call(
        running.router(),
        Request::delete(format!("/users/{id}")).body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = call(
        running.router(),
        Request::delete(format!("/users/{id}"))
            .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, problem) = call(
        running.router(),
        Request::get(format!("/users/{id}")).body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(problem["status"], 404);

    assert_eq!(
        wait_for(&recorder, 2).await,
        ["created:ada@example.com", "deleted:ada@example.com:admin"]
    );
    running.shutdown().await;
}

#[tokio::test]
async fn invalid_requests_map_to_problems() {
    let running = start(config()).await;

    let (status, _) = call(
        running.router(),
        post_user(json!({ "email": "grace@example.com", "display_name": "Grace" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, problem) = call(
        running.router(),
        post_user(json!({ "email": "GRACE@example.com", "display_name": "Grace" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(problem["detail"].as_str().unwrap().contains("grace@example.com"));

    let (status, _) = call(
        running.router(),
        post_user(json!({ "email": "nope", "display_name": "X" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, problem) = call(
        running.router(),
        post_user(json!({ "email": "x@example.com", "display_name": "X", "plan": "gold" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(problem["title"], "Unknown Plan");

    running.shutdown().await;
}

#[tokio::test]
async fn directory_service_is_published() {
    let running = start(config()).await;
    let services = running.context().services();
    assert_eq!(services.owner_of(USERS_DIRECTORY).as_deref(), Some("users"));

    let directory = services.get::<dyn UsersDirectory>(USERS_DIRECTORY).unwrap();
    assert_eq!(directory.count().await.unwrap(), 0);
    running.shutdown().await;
}

#[tokio::test]
async fn bad_module_config_fails_initialization() {
    let mut config = config();
    config
        .modules
        .insert("users".to_string(), json!({ "default_plan": "gold" }));

    let mut app = Application::new(config);
    app.register(Arc::new(UsersModule::default())).unwrap();
    let err = app.start().await.err().unwrap();

    match err {
        BootstrapError::Registry(RegistryError::Initialize { module, source, .. }) => {
            assert_eq!(module, "users");
            assert!(source.to_string().contains("gold"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}
