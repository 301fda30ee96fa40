//! Loopback demo of the stream gateway.
//!
//! Run with: cargo run -p loopback-demo
//!
//! Two sessions share one scripted in-process backend. A login QR code
//! reaches both, `alice` claims it and logs in, and a correlated
//! `GET_CONTACT` reply comes back on the shared stream.

use std::sync::Arc;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde_json::json;
use stream_gateway::{Credentials, Gateway, GatewayConfig, SessionHandle};
use stream_gateway_core::{ApiType, Delivery, ResponseType, StreamResponse};
use stream_gateway_transport::MemoryBackend;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const QRCODE_ID: u64 = 1001;
const UIN: u64 = 42;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let credentials = Credentials::from_env()
        .unwrap_or_else(|_| Credentials::new("demo-token", "mem://loopback"));
    let config = GatewayConfig::from_env()?;

    let backend = scripted_backend();
    let gateway = Gateway::new(Arc::new(backend.clone()), config);

    let mut alice = gateway
        .attach(&credentials.token, &credentials.endpoint, "alice")
        .await?;
    let mut bob = gateway
        .attach(&credentials.token, &credentials.endpoint, "bob")
        .await?;

    // The QR code is pushed to every session that has not logged in yet.
    gateway.request(ApiType::GetQrcode, None).await?;
    let delivery = alice.recv().await?;
    log_delivery(&alice, &delivery);
    let delivery = bob.recv().await?;
    log_delivery(&bob, &delivery);

    alice.claim_qrcode(QRCODE_ID)?;
    backend.push(StreamResponse::push(
        ResponseType::AccountLogin,
        json!({ "qrcodeId": QRCODE_ID, "uin": UIN, "userName": "alice" }).to_string(),
    ));
    let delivery = alice.recv().await?;
    log_delivery(&alice, &delivery);

    if let Some(reply) = gateway
        .request(ApiType::GetContact, Some(&json!({ "uin": UIN })))
        .await?
    {
        tracing::info!(
            request_id = %reply.frame.request_id,
            contacts = %reply.frame.data,
            "Contact list"
        );
    }

    backend.push(StreamResponse::push(
        ResponseType::MessageReceive,
        json!({ "uin": UIN, "content": "hello alice" }).to_string(),
    ));
    let delivery = alice.recv().await?;
    log_delivery(&alice, &delivery);
    let pending = bob.try_recv()?;
    tracing::info!(?pending, "Bob after alice's message");

    gateway.shutdown().await;
    Ok(())
}

/// Backend answering `GET_QRCODE` with a push and `GET_CONTACT` with a reply.
fn scripted_backend() -> MemoryBackend {
    let backend = MemoryBackend::new();
    backend.set_responder(|request| match request.api_type {
        ApiType::GetQrcode => vec![StreamResponse::push(
            ResponseType::LoginQrcode,
            json!({ "qrcodeId": QRCODE_ID, "qrcode": BASE64.encode(b"qr-image") }).to_string(),
        )],
        ApiType::GetContact => vec![StreamResponse::reply(
            request.request_id.clone(),
            ResponseType::ContactList,
            json!([{ "userName": "bob", "nickName": "Bob" }]).to_string(),
        )],
        _ => Vec::new(),
    });
    backend
}

fn log_delivery(session: &SessionHandle, delivery: &Delivery) {
    tracing::info!(
        session = %session.name(),
        response_type = ?delivery.frame.response_type,
        attachment = ?delivery.attachment,
        identity = ?session.identity(),
        "Delivery"
    );
}
