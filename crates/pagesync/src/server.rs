use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use pagesync_core::browser::ChromeLauncher;
use pagesync_core::response::SyncResponse;
use pagesync_core::service::SyncService;
use pagesync_core::webhook::WebhookRequest;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

type Service = SyncService<ChromeLauncher>;

pub async fn serve(service: Service, bind: &str) -> Result<()> {
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    let address = listener
        .local_addr()
        .context("failed to read listener address")?;
    info!(%address, "listening for webhooks");

    axum::serve(listener, router(Arc::new(service)))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("webhook server failed")?;

    info!("server shutdown complete");
    Ok(())
}

fn router(service: Arc<Service>) -> Router {
    Router::new()
        .route("/webhook", post(receive_webhook))
        .route("/health", get(health))
        .with_state(service)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn receive_webhook(
    State(service): State<Arc<Service>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let request = webhook_request(&headers, body);
    into_http(service.receive_detached(request).await)
}

/// Repeated headers are folded into one comma-separated value.
fn webhook_request(headers: &HeaderMap, body: String) -> WebhookRequest {
    let mut folded: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let Ok(value) = value.to_str() else {
            continue;
        };
        folded
            .entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    WebhookRequest::new(folded, body)
}

fn into_http(response: SyncResponse) -> Response {
    let status =
        StatusCode::from_u16(response.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        response.body(),
    )
        .into_response()
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = signal::ctrl_c().await {
            warn!(%error, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(error) => {
                warn!(%error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn headers_are_folded_into_webhook_request() {
        let mut headers = HeaderMap::new();
        headers.insert("x-github-event", HeaderValue::from_static("push"));
        headers.append("x-github-event", HeaderValue::from_static("ping"));
        headers.insert(
            "x-hub-signature-256",
            HeaderValue::from_static("sha256=00"),
        );

        let request = webhook_request(&headers, "{}".to_string());
        assert_eq!(request.header("X-GitHub-Event"), Some("push, ping"));
        assert_eq!(request.header("X-Hub-Signature-256"), Some("sha256=00"));
        assert_eq!(request.body, "{}");
    }

    #[test]
    fn responses_keep_status_and_json_body() {
        let response = into_http(SyncResponse::ok("not applicable"));
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|value| value.to_str().ok()),
            Some("application/json")
        );

        let rejected = into_http(SyncResponse {
            status_code: 401,
            message: "unauthorized signature".to_string(),
        });
        assert_eq!(rejected.status(), StatusCode::UNAUTHORIZED);
    }
}
