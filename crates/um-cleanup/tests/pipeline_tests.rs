//! Deletion pipeline against mocked downstream services

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use um_cleanup::catalogue::{ANALYTICS_OPERATORS, EXPORT_DATABASES, WAITING_ROOM_DEVICES};
use um_cleanup::{
    BatchDrainer, CleanupError, DeletionOrchestrator, DownstreamClient, PipelineBuilder,
};
use um_identity::{
    CredentialCache, CredentialSettings, KeycloakAdminClient, ServiceAccessToken, TokenMinter,
    UserDirectory,
};

const USER: &str = "user-a";

fn client(attempts: u32) -> DownstreamClient {
    DownstreamClient::with_client(reqwest::Client::new(), attempts, Duration::from_millis(1))
}

fn directory(server: &MockServer) -> Arc<dyn UserDirectory> {
    let settings = CredentialSettings {
        token_url: CredentialSettings::token_endpoint(&server.uri(), "test"),
        client_id: "user-management".to_string(),
        client_secret: "secret".to_string(),
        expiration_buffer: chrono::Duration::seconds(2),
    };
    let token = ServiceAccessToken {
        access_token: "service-token".to_string(),
        expires_at: Utc::now() + chrono::Duration::seconds(300),
        refresh_token: None,
        refresh_expires_at: None,
    };
    let credentials = Arc::new(CredentialCache::with_token(
        settings,
        reqwest::Client::new(),
        token,
    ));
    Arc::new(KeycloakAdminClient::new(
        server.uri(),
        "test",
        reqwest::Client::new(),
        credentials,
    ))
}

fn orchestrator(builder: PipelineBuilder, server: &MockServer) -> DeletionOrchestrator {
    let minter = TokenMinter::unsigned("users-service", chrono::Duration::minutes(10));
    DeletionOrchestrator::new(Arc::new(minter), builder.build(directory(server)))
}

async fn identity_deleted(server: &MockServer, status: u16) {
    Mock::given(method("DELETE"))
        .and(path(format!("/auth/admin/realms/test/users/{}", USER)))
        .respond_with(ResponseTemplate::new(status))
        .expect(1)
        .mount(server)
        .await;
}

fn devices(range: std::ops::Range<usize>) -> serde_json::Value {
    let result: Vec<_> = range.map(|i| json!({"id": format!("dev-{}", i)})).collect();
    json!({ "result": result })
}

#[tokio::test]
async fn test_paged_resource_drains_in_batches() {
    let server = MockServer::start().await;

    // 25 devices at batch size 10: three full listings, then an empty one
    for page in [devices(0..10), devices(10..20), devices(20..25)] {
        Mock::given(method("GET"))
            .and(path("/devices"))
            .and(query_param("limit", "10"))
            .and(query_param("offset", "0"))
            .and(query_param("show_hidden", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
    }
    Mock::given(method("GET"))
        .and(path("/devices"))
        .respond_with(ResponseTemplate::new(200).set_body_json(devices(0..0)))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/devices"))
        .and(header("X-UserId", USER))
        .respond_with(ResponseTemplate::new(204))
        .expect(3)
        .mount(&server)
        .await;
    identity_deleted(&server, 204).await;

    let builder = PipelineBuilder::new(client(1), BatchDrainer::new(10, 100))
        .resource(WAITING_ROOM_DEVICES, &server.uri());
    orchestrator(builder, &server).delete_user(USER).await.unwrap();
}

#[tokio::test]
async fn test_public_databases_of_others_are_kept() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/databases"))
        .and(query_param("offset", "0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"ID": "a-private", "Public": false, "UserId": USER},
            {"ID": "b-public", "Public": true, "UserId": "user-b"},
            {"ID": "a-public", "Public": true, "UserId": USER},
        ])))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    // The retained entry moves the offset past itself
    Mock::given(method("GET"))
        .and(path("/databases"))
        .and(query_param("offset", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&server)
        .await;
    for id in ["a-private", "a-public"] {
        Mock::given(method("DELETE"))
            .and(path(format!("/databases/{}", id)))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
    }
    Mock::given(method("DELETE"))
        .and(path("/databases/b-public"))
        .respond_with(ResponseTemplate::new(204))
        .expect(0)
        .mount(&server)
        .await;
    identity_deleted(&server, 204).await;

    let builder = PipelineBuilder::new(client(1), BatchDrainer::new(50, 100))
        .resource(EXPORT_DATABASES, &server.uri());
    orchestrator(builder, &server).delete_user(USER).await.unwrap();
}

#[tokio::test]
async fn test_only_own_operators_are_deleted() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/operator"))
        .and(query_param("limit", "0"))
        .and(query_param("offset", "0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"operators": [
            {"_id": "op-1", "pub": false, "userId": USER},
            {"_id": "op-2", "pub": true, "userId": "user-b"},
            {"_id": "op-3", "pub": true, "userId": USER},
        ]})))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/operator"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"operators": [
            {"_id": "op-2", "pub": true, "userId": "user-b"},
        ]})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/operator"))
        .and(body_json(json!(["op-1", "op-3"])))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    identity_deleted(&server, 204).await;

    let builder = PipelineBuilder::new(client(1), BatchDrainer::new(10, 100))
        .resource(ANALYTICS_OPERATORS, &server.uri());
    orchestrator(builder, &server).delete_user(USER).await.unwrap();
}

#[tokio::test]
async fn test_failing_step_aborts_remaining_steps() {
    let server = MockServer::start().await;
    let base = server.uri();

    let mut builder = PipelineBuilder::new(client(2), BatchDrainer::new(10, 100));
    for i in 1..=7 {
        let (status, expected) = match i {
            1 | 2 => (204, 1),
            3 => (500, 2),
            _ => (204, 0),
        };
        Mock::given(method("DELETE"))
            .and(path(format!("/step-{}", i)))
            .respond_with(ResponseTemplate::new(status))
            .expect(expected)
            .mount(&server)
            .await;
        builder = builder.singleton(&format!("step-{}", i), &base, &format!("step-{}", i));
    }
    Mock::given(method("DELETE"))
        .and(path(format!("/auth/admin/realms/test/users/{}", USER)))
        .respond_with(ResponseTemplate::new(204))
        .expect(0)
        .mount(&server)
        .await;

    let err = orchestrator(builder, &server)
        .delete_user(USER)
        .await
        .unwrap_err();

    assert_eq!(err.failed_step(), Some("step-3"));
    match err {
        CleanupError::StepFailed {
            position, source, ..
        } => {
            assert_eq!(position, 3);
            assert!(matches!(*source, CleanupError::Downstream { status: 500, .. }));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_missing_identity_is_success() {
    let server = MockServer::start().await;
    identity_deleted(&server, 404).await;

    let builder = PipelineBuilder::new(client(1), BatchDrainer::new(10, 100));
    orchestrator(builder, &server).delete_user(USER).await.unwrap();
}

#[tokio::test]
async fn test_transient_failure_is_retried() {
    let server = MockServer::start().await;

    Mock::given(method("DELETE"))
        .and(path("/platform-broker"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/platform-broker"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    identity_deleted(&server, 204).await;

    let builder = PipelineBuilder::new(client(3), BatchDrainer::new(10, 100)).singleton(
        "platform-broker",
        &server.uri(),
        "platform-broker",
    );
    orchestrator(builder, &server).delete_user(USER).await.unwrap();
}

#[tokio::test]
async fn test_client_errors_are_not_retried() {
    let server = MockServer::start().await;

    Mock::given(method("DELETE"))
        .and(path("/users/user-a"))
        .respond_with(ResponseTemplate::new(403))
        .expect(1)
        .mount(&server)
        .await;

    let builder = PipelineBuilder::new(client(3), BatchDrainer::new(10, 100)).per_user(
        "device-repository",
        &server.uri(),
        "users",
    );
    let err = orchestrator(builder, &server)
        .delete_user(USER)
        .await
        .unwrap_err();
    assert_eq!(err.failed_step(), Some("device-repository"));
}

#[tokio::test]
async fn test_listing_that_never_shrinks_hits_loop_limit() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/devices"))
        .respond_with(ResponseTemplate::new(200).set_body_json(devices(0..2)))
        .expect(4)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/devices"))
        .respond_with(ResponseTemplate::new(204))
        .expect(4)
        .mount(&server)
        .await;

    let builder = PipelineBuilder::new(client(1), BatchDrainer::new(10, 4))
        .resource(WAITING_ROOM_DEVICES, &server.uri());
    let err = orchestrator(builder, &server)
        .delete_user(USER)
        .await
        .unwrap_err();

    match err {
        CleanupError::StepFailed { source, .. } => {
            assert!(matches!(*source, CleanupError::LoopLimitExceeded { limit: 4, .. }));
        }
        other => panic!("unexpected error: {other}"),
    }
}
