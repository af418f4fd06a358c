//! Contract tests for the callback webhook.
//!
//! Tests:
//! - Known subscription ids are delivered with 200
//! - Unknown ids and a disabled service answer 410
//! - Decode failures, including non-UTF-8 bodies, follow the configured
//!   policy
//! - PUT and DELETE are accepted and ignored

mod common;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use common::{recorder, TestFixture, WEBHOOK_PATH};
use fhirhook::payload::PayloadType;
use fhirhook::service::DecodeFailurePolicy;
use tower::ServiceExt;

/// Send one request to the webhook and return the status.
async fn call(
    fixture: &TestFixture,
    method: Method,
    id: &str,
    body: impl AsRef<[u8]>,
) -> StatusCode {
    let request = Request::builder()
        .method(method)
        .uri(format!("{WEBHOOK_PATH}/{id}"))
        .header("content-type", "application/fhir+json")
        .body(Body::from(body.as_ref().to_vec()))
        .unwrap();

    fixture.app().oneshot(request).await.unwrap().status()
}

#[tokio::test]
async fn test_post_delivers_notification() {
    let fixture = TestFixture::new();
    let (callback, events) = recorder();
    let wrapper = fixture
        .registry
        .subscribe("Patient?", Some(PayloadType::Json), callback)
        .await
        .unwrap()
        .unwrap();

    let status = call(
        &fixture,
        Method::POST,
        wrapper.subscription_id(),
        r#"{"resourceType":"Patient","id":"p1"}"#,
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let events = events.lock();
    assert_eq!(events.len(), 1);
    assert_eq!(
        events[0].resource.as_ref().unwrap().id.as_deref(),
        Some("p1")
    );
}

#[tokio::test]
async fn test_get_without_body_is_ping() {
    let fixture = TestFixture::new();
    let (callback, events) = recorder();
    let wrapper = fixture
        .registry
        .subscribe("Patient?", None, callback)
        .await
        .unwrap()
        .unwrap();

    let status = call(&fixture, Method::GET, wrapper.subscription_id(), "").await;

    assert_eq!(status, StatusCode::OK);
    assert!(events.lock()[0].resource.is_none());
}

#[tokio::test]
async fn test_unknown_id_is_gone() {
    let fixture = TestFixture::new();
    let status = call(&fixture, Method::POST, "3f1c9a6e-unknown", "").await;
    assert_eq!(status, StatusCode::GONE);
}

#[tokio::test]
async fn test_released_subscription_is_gone() {
    let fixture = TestFixture::new();
    let (callback, _) = recorder();
    let wrapper = fixture
        .registry
        .subscribe("Patient?", None, callback.clone())
        .await
        .unwrap()
        .unwrap();
    fixture.registry.unsubscribe(&wrapper, &callback).await.unwrap();

    let status = call(&fixture, Method::POST, wrapper.subscription_id(), "").await;
    assert_eq!(status, StatusCode::GONE);
}

#[tokio::test]
async fn test_disabled_service_is_gone() {
    let fixture = TestFixture::disabled();
    let status = call(&fixture, Method::POST, "any", "").await;
    assert_eq!(status, StatusCode::GONE);
}

#[tokio::test]
async fn test_put_and_delete_are_ignored() {
    let fixture = TestFixture::new();
    let (callback, events) = recorder();
    let wrapper = fixture
        .registry
        .subscribe("Patient?", None, callback)
        .await
        .unwrap()
        .unwrap();

    for method in [Method::PUT, Method::DELETE] {
        let status = call(&fixture, method, wrapper.subscription_id(), "{}").await;
        assert_eq!(status, StatusCode::OK);
    }
    assert!(events.lock().is_empty());
    assert_eq!(wrapper.ref_count(), 1);
}

#[tokio::test]
async fn test_bad_payload_with_drop_policy() {
    let fixture = TestFixture::with_policy(DecodeFailurePolicy::Drop);
    let (callback, _) = recorder();
    let wrapper = fixture
        .registry
        .subscribe("Patient?", None, callback)
        .await
        .unwrap()
        .unwrap();
    let id = wrapper.subscription_id();

    assert_eq!(
        call(&fixture, Method::POST, id, "{broken").await,
        StatusCode::BAD_REQUEST
    );
    assert_eq!(call(&fixture, Method::POST, id, "").await, StatusCode::OK);
}

#[tokio::test]
async fn test_bad_payload_with_disable_policy() {
    let fixture = TestFixture::with_policy(DecodeFailurePolicy::Disable);
    let (callback, _) = recorder();
    let wrapper = fixture
        .registry
        .subscribe("Patient?", None, callback)
        .await
        .unwrap()
        .unwrap();
    let id = wrapper.subscription_id();

    assert_eq!(
        call(&fixture, Method::POST, id, "<Patient><id></Patient>").await,
        StatusCode::GONE
    );
    assert_eq!(call(&fixture, Method::POST, id, "").await, StatusCode::GONE);
    assert!(fixture.router.is_disabled());
}

const NOT_UTF8: &[u8] = b"{\"resourceType\":\"Patient\",\"name\":\"\xc3\x28\"}";

#[tokio::test]
async fn test_non_utf8_body_with_drop_policy() {
    let fixture = TestFixture::with_policy(DecodeFailurePolicy::Drop);
    let (callback, events) = recorder();
    let wrapper = fixture
        .registry
        .subscribe("Patient?", None, callback)
        .await
        .unwrap()
        .unwrap();
    let id = wrapper.subscription_id();

    assert_eq!(
        call(&fixture, Method::POST, id, NOT_UTF8).await,
        StatusCode::BAD_REQUEST
    );
    assert!(!fixture.router.is_disabled());
    assert!(events.lock().is_empty());
}

#[tokio::test]
async fn test_non_utf8_body_with_disable_policy() {
    let fixture = TestFixture::with_policy(DecodeFailurePolicy::Disable);
    let (callback, _) = recorder();
    let wrapper = fixture
        .registry
        .subscribe("Patient?", None, callback)
        .await
        .unwrap()
        .unwrap();
    let id = wrapper.subscription_id();

    assert_eq!(
        call(&fixture, Method::POST, id, NOT_UTF8).await,
        StatusCode::GONE
    );
    assert!(fixture.router.is_disabled());
    assert_eq!(call(&fixture, Method::POST, id, "").await, StatusCode::GONE);
}

#[tokio::test]
async fn test_error_body_is_json() {
    let fixture = TestFixture::new();
    let request = Request::builder()
        .method(Method::POST)
        .uri(format!("{WEBHOOK_PATH}/missing"))
        .body(Body::empty())
        .unwrap();

    let response = fixture.app().oneshot(request).await.unwrap();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

    assert_eq!(json["error"], true);
    assert_eq!(json["code"], "GONE");
}
