//! End-to-end tests for customer notifications.
//!
//! The order service announces on the in-process log broker; the
//! notification service consumes with its own group. The relay path is
//! exercised through signed callbacks against the webhook endpoints.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use storefront_events::{
    sign, webhook_router, BusConfig, LogTransport, MemoryLog, Service, SignatureVerifier,
    SigningKey, Topic, Transport, WebhookState,
};
use storefront_notifications::{notification_router, MemoryMailer, ORDER_SUBJECT, WELCOME_SUBJECT};
use tower::ServiceExt;

const SIGNING_KEY: &str = "sig_notifications";

async fn wait_for_emails(mailer: &MemoryMailer, count: usize) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while mailer.sent().len() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("emails were not sent in time");
}

#[tokio::test]
async fn test_log_events_send_emails() {
    let broker = MemoryLog::default();
    let mailer = Arc::new(MemoryMailer::new());

    let consumer = LogTransport::new(broker.clone(), BusConfig::local("notification-service", 0).log);
    consumer.connect().await.unwrap();
    consumer
        .subscribe(Arc::new(notification_router(mailer.clone()).unwrap()))
        .await
        .unwrap();

    let producer = LogTransport::new(broker, BusConfig::local("order-service", 0).log);
    producer.connect().await.unwrap();
    producer
        .publish_payload(
            Topic::UserCreated,
            Service::Auth,
            json!({"email": "ada@example.com", "username": "ada"}),
        )
        .await
        .unwrap();
    producer
        .publish_payload(
            Topic::OrderCreated,
            Service::Order,
            json!({"orderId": "ord_abc123", "email": "ada@example.com", "amount": 1999, "status": "success"}),
        )
        .await
        .unwrap();

    wait_for_emails(&mailer, 2).await;
    consumer.disconnect().await.unwrap();

    let mut subjects: Vec<String> = mailer.sent().into_iter().map(|email| email.subject).collect();
    subjects.sort();
    assert_eq!(subjects, vec![ORDER_SUBJECT.to_string(), WELCOME_SUBJECT.to_string()]);
    let confirmation = mailer
        .sent()
        .into_iter()
        .find(|email| email.subject == ORDER_SUBJECT)
        .unwrap();
    assert!(confirmation.text.contains("Amount: 19.99"));
}

#[tokio::test]
async fn test_log_mail_outage_is_dead_lettered() {
    let broker = MemoryLog::default();
    let mailer = Arc::new(MemoryMailer::new());
    mailer.set_failing(true);

    let mut config = BusConfig::local("notification-service", 0).log;
    config.handler_retry = config.handler_retry.with_max_attempts(2);
    let consumer = LogTransport::new(broker.clone(), config);
    consumer.connect().await.unwrap();
    consumer
        .subscribe(Arc::new(notification_router(mailer.clone()).unwrap()))
        .await
        .unwrap();

    consumer
        .publish_payload(
            Topic::UserCreated,
            Service::Auth,
            json!({"email": "bo@example.com", "username": "bo"}),
        )
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while consumer.stats().dead_lettered == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("record was not dead-lettered");
    consumer.disconnect().await.unwrap();

    assert!(mailer.sent().is_empty());
    assert_eq!(broker.records(&Topic::UserCreated.dead_letter()).len(), 1);
}

#[tokio::test]
async fn test_relay_callback_sends_email() {
    let mailer = Arc::new(MemoryMailer::new());
    let app = webhook_router(WebhookState::new(
        "notification-service",
        Arc::new(notification_router(mailer.clone()).unwrap()),
        SignatureVerifier::with_key(SIGNING_KEY),
        Duration::from_secs(5),
    ));

    let body = serde_json::to_vec(&json!({
        "body": {"email": "cy@example.com", "amount": 5000, "status": "success"}
    }))
    .unwrap();
    let request = Request::builder()
        .method("POST")
        .uri("/qstash/order.created")
        .header("Upstash-Signature", sign(&body, &SigningKey::from(SIGNING_KEY)))
        .body(Body::from(body))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let sent = mailer.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "cy@example.com");
    assert_eq!(sent[0].text, "Hello! Your order: Amount: 50.00, Status: success");
}
