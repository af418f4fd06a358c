//! Tests for the FHIR REST backend against a mock FHIR server.
//!
//! Tests:
//! - Subscription creation payload and id extraction
//! - Deletion, including already-deleted subscriptions
//! - Tag purge with and without conditional delete support, across
//!   paged search results
//! - End-to-end registry use over HTTP

use std::sync::Arc;
use std::time::Duration;

use fhirhook::backend::{
    BackendError, FhirRestBackend, FhirVersion, RemoteHandle, SubscriptionBackend,
    SubscriptionRequest, TrackingTag,
};
use fhirhook::flow::{EventBus, ResourceEvent};
use fhirhook::payload::PayloadType;
use fhirhook::service::{RegistryConfig, SubscriptionRegistry};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const CALLBACK: &str = "http://bridge.local/fhir-callback/";

fn backend(server: &MockServer, version: FhirVersion) -> FhirRestBackend {
    FhirRestBackend::new(&server.uri(), version, Duration::from_secs(5)).unwrap()
}

fn request() -> SubscriptionRequest {
    SubscriptionRequest {
        criteria: "Patient?name=smith".into(),
        payload_type: PayloadType::Json,
        endpoint: format!("{CALLBACK}abc"),
        tag: TrackingTag::for_callback(CALLBACK),
        reason: "fhirhook subscriber".into(),
    }
}

#[tokio::test]
async fn test_create_posts_subscription_and_reads_body_id() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/Subscription"))
        .and(header("content-type", "application/fhir+json"))
        .and(header("prefer", "return=representation"))
        .and(body_partial_json(json!({
            "resourceType": "Subscription",
            "criteria": "Patient?name=smith",
            "status": "requested",
            "channel": {
                "type": "rest-hook",
                "endpoint": "http://bridge.local/fhir-callback/abc",
                "payload": "application/fhir+json"
            }
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "resourceType": "Subscription",
            "id": "sub-42"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let handle = backend(&server, FhirVersion::R4)
        .create_subscription(&request())
        .await
        .unwrap();

    assert_eq!(handle.as_str(), "sub-42");
}

#[tokio::test]
async fn test_create_falls_back_to_location_header() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/Subscription"))
        .respond_with(
            ResponseTemplate::new(201)
                .insert_header("location", format!("{}/Subscription/77/_history/1", server.uri())),
        )
        .mount(&server)
        .await;

    let handle = backend(&server, FhirVersion::Stu3)
        .create_subscription(&request())
        .await
        .unwrap();

    assert_eq!(handle.as_str(), "77");
}

#[tokio::test]
async fn test_create_without_id_fails() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/Subscription"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&server)
        .await;

    let result = backend(&server, FhirVersion::R4)
        .create_subscription(&request())
        .await;

    assert!(matches!(result, Err(BackendError::MissingId)));
}

#[tokio::test]
async fn test_create_rejected_by_server() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/Subscription"))
        .respond_with(ResponseTemplate::new(422).set_body_string("invalid criteria"))
        .mount(&server)
        .await;

    let result = backend(&server, FhirVersion::R4)
        .create_subscription(&request())
        .await;

    match result {
        Err(BackendError::Status { status, body }) => {
            assert_eq!(status, 422);
            assert_eq!(body, "invalid criteria");
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test]
async fn test_dstu2_uses_legacy_content_type() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/Subscription"))
        .and(header("content-type", "application/json+fhir"))
        .and(body_partial_json(json!({
            "tag": [{"system": CALLBACK, "code": "ResourceSubscription"}]
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "d2"})))
        .expect(1)
        .mount(&server)
        .await;

    let handle = backend(&server, FhirVersion::Dstu2)
        .create_subscription(&request())
        .await
        .unwrap();

    assert_eq!(handle.as_str(), "d2");
}

#[tokio::test]
async fn test_delete_tolerates_missing_subscription() {
    let server = MockServer::start().await;

    Mock::given(method("DELETE"))
        .and(path("/Subscription/gone"))
        .respond_with(ResponseTemplate::new(410))
        .expect(1)
        .mount(&server)
        .await;

    backend(&server, FhirVersion::R4)
        .delete_subscription(&RemoteHandle::new("gone"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_delete_server_error() {
    let server = MockServer::start().await;

    Mock::given(method("DELETE"))
        .and(path("/Subscription/s1"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let result = backend(&server, FhirVersion::R4)
        .delete_subscription(&RemoteHandle::new("s1"))
        .await;

    assert!(matches!(result, Err(BackendError::Status { status: 500, .. })));
}

#[tokio::test]
async fn test_purge_uses_conditional_delete() {
    let server = MockServer::start().await;
    let tag = TrackingTag::for_callback(CALLBACK);

    Mock::given(method("DELETE"))
        .and(path("/Subscription"))
        .and(query_param("_tag", tag.token()))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    backend(&server, FhirVersion::R4)
        .delete_all_by_tag(&tag)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_purge_falls_back_to_search() {
    let server = MockServer::start().await;
    let tag = TrackingTag::for_callback(CALLBACK);

    Mock::given(method("DELETE"))
        .and(path("/Subscription"))
        .respond_with(ResponseTemplate::new(412))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/Subscription"))
        .and(query_param("_tag", tag.token()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "resourceType": "Bundle",
            "entry": [
                {"resource": {"resourceType": "Subscription", "id": "a"}},
                {"resource": {"resourceType": "Subscription", "id": "b"}}
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    for id in ["a", "b"] {
        Mock::given(method("DELETE"))
            .and(path(format!("/Subscription/{id}")))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
    }

    backend(&server, FhirVersion::R4)
        .delete_all_by_tag(&tag)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_purge_follows_search_pages() {
    let server = MockServer::start().await;
    let tag = TrackingTag::for_callback(CALLBACK);

    Mock::given(method("DELETE"))
        .and(path("/Subscription"))
        .respond_with(ResponseTemplate::new(412))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/Subscription"))
        .and(query_param("_tag", tag.token()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "resourceType": "Bundle",
            "link": [
                {"relation": "self", "url": format!("{}/Subscription", server.uri())},
                {"relation": "next", "url": format!("{}/?_getpages=p1&_offset=1", server.uri())}
            ],
            "entry": [{"resource": {"resourceType": "Subscription", "id": "a"}}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/"))
        .and(query_param("_getpages", "p1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "resourceType": "Bundle",
            "entry": [{"resource": {"resourceType": "Subscription", "id": "b"}}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    for id in ["a", "b"] {
        Mock::given(method("DELETE"))
            .and(path(format!("/Subscription/{id}")))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
    }

    backend(&server, FhirVersion::R4)
        .delete_all_by_tag(&tag)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_purge_attempts_every_delete_before_failing() {
    let server = MockServer::start().await;
    let tag = TrackingTag::for_callback(CALLBACK);

    Mock::given(method("DELETE"))
        .and(path("/Subscription"))
        .respond_with(ResponseTemplate::new(412))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/Subscription"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "resourceType": "Bundle",
            "entry": [
                {"resource": {"resourceType": "Subscription", "id": "a"}},
                {"resource": {"resourceType": "Subscription", "id": "b"}}
            ]
        })))
        .mount(&server)
        .await;

    Mock::given(method("DELETE"))
        .and(path("/Subscription/a"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("DELETE"))
        .and(path("/Subscription/b"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let result = backend(&server, FhirVersion::R4).delete_all_by_tag(&tag).await;

    assert!(matches!(result, Err(BackendError::Status { status: 500, .. })));
}

#[tokio::test]
async fn test_registry_over_http() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/Subscription"))
        .and(body_partial_json(json!({"criteria": "Patient?"})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "remote-1"})))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("DELETE"))
        .and(path("/Subscription/remote-1"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let registry = SubscriptionRegistry::new(
        RegistryConfig::new(Some("http://bridge.local/fhir-callback".into())),
        Arc::new(backend(&server, FhirVersion::R4)),
        Arc::new(EventBus::new()),
    );
    let callback: fhirhook::flow::Callback = Arc::new(|_: &ResourceEvent| {});

    let first = registry
        .subscribe("Patient?", Some(PayloadType::Json), callback.clone())
        .await
        .unwrap()
        .unwrap();
    let second = registry
        .subscribe("Patient?", Some(PayloadType::Json), callback.clone())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.remote_handle(), Some(RemoteHandle::new("remote-1")));

    registry.unsubscribe(&first, &callback).await.unwrap();
    registry.unsubscribe(&second, &callback).await.unwrap();
}
