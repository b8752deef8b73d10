//! Entrypoint — HTTP fetch endpoint for configuration resources
//!
//! Serves `GET /<resource-name>` with the provider's raw bytes so clients can
//! re-fetch a resource after a change notification.

use crate::error::{ConfigServiceError, Result};
use crate::provider::{validate_resource_name, ConfigurationProvider};
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A running fetch endpoint
pub struct FetchEndpoint {
    local_addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl FetchEndpoint {
    /// Bound address (resolves port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Base URI clients use as `service_uri`
    pub fn base_uri(&self) -> String {
        format!("http://{}", self.local_addr)
    }

    /// Wait for the accept loop to finish after cancellation
    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            tracing::error!(error = %e, "Fetch endpoint task failed");
        }
    }
}

/// Bind `addr` and serve resources from `provider` until `cancel` fires
pub async fn start_fetch_endpoint(
    addr: SocketAddr,
    provider: Arc<dyn ConfigurationProvider>,
    cancel: CancellationToken,
) -> Result<FetchEndpoint> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| ConfigServiceError::Other(format!("Failed to bind {}: {}", addr, e)))?;
    let local_addr = listener.local_addr()?;

    tracing::info!(address = %local_addr, "Fetch endpoint listening");

    let handle = tokio::spawn(async move {
        loop {
            let (stream, remote_addr) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to accept connection");
                        continue;
                    }
                },
            };

            let provider = provider.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                if let Err(e) = http1::Builder::new()
                    .serve_connection(
                        io,
                        service_fn(|req| handle_fetch_request(req, provider.clone())),
                    )
                    .await
                {
                    tracing::debug!(remote = %remote_addr, error = %e, "Connection closed with error");
                }
            });
        }
        tracing::info!(address = %local_addr, "Fetch endpoint stopped");
    });

    Ok(FetchEndpoint { local_addr, handle })
}

/// Handle an individual fetch request
async fn handle_fetch_request(
    req: Request<Incoming>,
    provider: Arc<dyn ConfigurationProvider>,
) -> std::result::Result<Response<Full<Bytes>>, hyper::Error> {
    if req.method() != Method::GET {
        return Ok(text_response(
            StatusCode::METHOD_NOT_ALLOWED,
            "only GET is supported",
        ));
    }

    let raw = req.uri().path().trim_start_matches('/');
    let name = match urlencoding::decode(raw) {
        Ok(name) => name.into_owned(),
        Err(_) => {
            return Ok(text_response(
                StatusCode::BAD_REQUEST,
                "resource name is not valid UTF-8",
            ))
        }
    };
    if let Err(e) = validate_resource_name(&name) {
        return Ok(text_response(StatusCode::BAD_REQUEST, &e.to_string()));
    }

    match provider.get_configuration(&name).await {
        Ok(content) => {
            tracing::debug!(resource = %name, bytes = content.len(), "Served resource");
            let mut response = Response::new(Full::new(content));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("application/octet-stream"),
            );
            Ok(response)
        }
        Err(ConfigServiceError::ResourceNotFound(_)) => {
            tracing::debug!(resource = %name, "Resource not found");
            Ok(text_response(StatusCode::NOT_FOUND, "resource not found"))
        }
        Err(e) => {
            tracing::error!(resource = %name, error = %e, "Failed to serve resource");
            Ok(text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to read resource",
            ))
        }
    }
}

fn text_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(message.to_string())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::tests::MemoryProvider;
    use std::time::Duration;

    async fn start(provider: Arc<MemoryProvider>) -> (FetchEndpoint, CancellationToken) {
        let cancel = CancellationToken::new();
        let endpoint = start_fetch_endpoint(
            "127.0.0.1:0".parse().unwrap(),
            provider,
            cancel.clone(),
        )
        .await
        .unwrap();
        (endpoint, cancel)
    }

    #[tokio::test]
    async fn test_serves_resource_bytes() {
        let provider = MemoryProvider::with(&[("app.json", r#"{"A":"1"}"#), ("env/db.ini", "K=V")]);
        let (endpoint, cancel) = start(provider).await;
        assert_ne!(endpoint.local_addr().port(), 0);

        let resp = reqwest::get(format!("{}/app.json", endpoint.base_uri()))
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(
            resp.headers().get("content-type").unwrap(),
            "application/octet-stream"
        );
        assert_eq!(resp.text().await.unwrap(), r#"{"A":"1"}"#);

        let nested = reqwest::get(format!("{}/env/db.ini", endpoint.base_uri()))
            .await
            .unwrap();
        assert_eq!(nested.text().await.unwrap(), "K=V");

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_percent_encoded_name() {
        let provider = MemoryProvider::with(&[("my app.json", "{}")]);
        let (endpoint, cancel) = start(provider).await;

        let resp = reqwest::get(format!("{}/my%20app.json", endpoint.base_uri()))
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_missing_resource_is_404() {
        let (endpoint, cancel) = start(MemoryProvider::with(&[])).await;
        let resp = reqwest::get(format!("{}/nope.json", endpoint.base_uri()))
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_invalid_names_are_400() {
        let (endpoint, cancel) = start(MemoryProvider::with(&[])).await;
        for path in ["/", "/a%2F..%2Fb.json", "/a//b.json"] {
            let resp = reqwest::get(format!("{}{}", endpoint.base_uri(), path))
                .await
                .unwrap();
            assert_eq!(resp.status(), 400, "{}", path);
        }
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_other_methods_are_405() {
        let provider = MemoryProvider::with(&[("app.json", "{}")]);
        let (endpoint, cancel) = start(provider).await;
        let resp = reqwest::Client::new()
            .post(format!("{}/app.json", endpoint.base_uri()))
            .body("{}")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 405);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_cancel_stops_accept_loop() {
        let (endpoint, cancel) = start(MemoryProvider::with(&[])).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), endpoint.join())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_bind_conflict_fails() {
        let (endpoint, cancel) = start(MemoryProvider::with(&[])).await;
        let result = start_fetch_endpoint(
            endpoint.local_addr(),
            MemoryProvider::with(&[]),
            CancellationToken::new(),
        )
        .await;
        assert!(result.is_err());
        assert!(result.err().unwrap().to_string().contains("Failed to bind"));
        cancel.cancel();
    }
}
