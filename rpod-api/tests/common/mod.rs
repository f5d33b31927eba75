//! Common test utilities for rpod-api tests
//!
//! Builds the router over the in-memory backend, a users file and a
//! temporary host filesystem.

#![allow(dead_code)]

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use rpod_api::{create_app, AppState, ServiceInfo};
use rpod_config::{TierTable, YamlUserDirectory};
use rpod_orchestrator::{
    BuilderSettings, LocalFilesystem, OrchestratorSettings, SessionOrchestrator,
    WorkloadSpecBuilder,
};
use rpod_ports::{PortAllocator, PortRange};
use rpod_provider::mock::MockBackend;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt; // for `oneshot`

pub const USERS_YAML: &str = r#"
users:
  alice:
    tier: tier2
    password: alice-pw
    projects:
      - base: Genomics
        folders: [raw]
  bob:
    password: bob-pw
"#;

pub struct TestApp {
    pub app: Router,
    pub backend: Arc<MockBackend>,
    pub root: TempDir,
}

pub fn test_app(range: (u16, u16)) -> TestApp {
    let root = TempDir::new().expect("tempdir");
    std::fs::create_dir_all(root.path().join("lib")).expect("lib dir");
    std::fs::create_dir_all(root.path().join("projects")).expect("projects dir");
    let users_file = root.path().join("users.yaml");
    std::fs::write(&users_file, USERS_YAML).expect("users file");

    let backend = Arc::new(MockBackend::new());
    let port_range = PortRange::new(range.0, range.1).expect("valid range");
    let builder = WorkloadSpecBuilder::new(
        BuilderSettings {
            image: "rstudio:test".into(),
            container_port: 8787,
            shared_library_path: root.path().join("lib"),
            project_root_path: root.path().join("projects"),
            user_homes_path: root.path().join("homes"),
            library_mount_path: "/usr/local/lib/R/site-library".into(),
            project_mount_path: "/project-center".into(),
            validate_host_paths: true,
            tiers: TierTable::cluster(),
        },
        Arc::new(LocalFilesystem),
    );
    let orchestrator = SessionOrchestrator::new(
        Arc::new(YamlUserDirectory::new(&users_file)),
        backend.clone(),
        PortAllocator::new(port_range, backend.clone()),
        builder,
        OrchestratorSettings {
            public_host: "node.test".into(),
            settle_delay: Duration::ZERO,
            ..OrchestratorSettings::default()
        },
    );
    let info = ServiceInfo {
        backend: "mock".into(),
        users_file,
        port_range,
        max_session_hours: 12.0,
    };

    TestApp {
        app: create_app(AppState::new(orchestrator, info)),
        backend,
        root,
    }
}

pub fn form_request(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/x-www-form-urlencoded")
        .body(Body::from(body.to_string()))
        .expect("request")
}

pub fn get_request(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .body(Body::empty())
        .expect("request")
}

/// Send one request and return the status with the decoded JSON body.
pub async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("Failed to read response body");
    let json = serde_json::from_slice(&body).expect("Failed to deserialize JSON");
    (status, json)
}
