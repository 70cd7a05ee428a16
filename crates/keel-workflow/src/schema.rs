//! OpenAPI schema discovery.
//!
//! After a deployment's instances come up, the workflow asks them for an
//! OpenAPI document. The fetch is best-effort: any failure (connect,
//! non-2xx, timeout, non-UTF-8 body) yields `None` and the deployment
//! proceeds without request validation.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use tracing::debug;

/// Default path probed on each instance.
pub const SCHEMA_PATH: &str = "/openapi.yaml";

#[async_trait]
pub trait SchemaFetcher: Send + Sync {
    /// Fetch the schema served by the instance at `address` (`host:port`).
    async fn fetch(&self, address: &str) -> Option<String>;
}

/// Plain HTTP/1 fetcher.
#[derive(Debug, Clone)]
pub struct HttpSchemaFetcher {
    path: String,
    timeout: Duration,
}

impl Default for HttpSchemaFetcher {
    fn default() -> Self {
        Self {
            path: SCHEMA_PATH.to_string(),
            timeout: Duration::from_secs(5),
        }
    }
}

impl HttpSchemaFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_path(mut self, path: &str) -> Self {
        self.path = path.to_string();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl SchemaFetcher for HttpSchemaFetcher {
    async fn fetch(&self, address: &str) -> Option<String> {
        let uri = format!("http://{address}{}", self.path);
        match tokio::time::timeout(self.timeout, http_get(address, &uri)).await {
            Ok(body) => body,
            Err(_) => {
                debug!(%uri, "schema fetch timed out");
                None
            }
        }
    }
}

async fn http_get(address: &str, uri: &str) -> Option<String> {
    let stream = match tokio::net::TcpStream::connect(address).await {
        Ok(s) => s,
        Err(e) => {
            debug!(error = %e, %uri, "schema fetch connection failed");
            return None;
        }
    };

    let io = hyper_util::rt::TokioIo::new(stream);
    let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
        Ok(pair) => pair,
        Err(e) => {
            debug!(error = %e, %uri, "schema fetch handshake failed");
            return None;
        }
    };

    tokio::spawn(async move {
        let _ = conn.await;
    });

    let req = match http::Request::builder()
        .method("GET")
        .uri(uri)
        .header("host", address)
        .header("user-agent", "keel-workflow/0.1")
        .body(Empty::<Bytes>::new())
    {
        Ok(req) => req,
        Err(e) => {
            debug!(error = %e, %uri, "invalid schema request");
            return None;
        }
    };

    let resp = match sender.send_request(req).await {
        Ok(resp) => resp,
        Err(e) => {
            debug!(error = %e, %uri, "schema fetch request failed");
            return None;
        }
    };

    if !resp.status().is_success() {
        debug!(status = %resp.status(), %uri, "schema fetch non-2xx");
        return None;
    }

    let body = match resp.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!(error = %e, %uri, "schema body read failed");
            return None;
        }
    };

    match String::from_utf8(body.to_vec()) {
        Ok(text) if !text.trim().is_empty() => Some(text),
        _ => None,
    }
}

/// Ask each address in turn and return the first schema found.
pub async fn fetch_first(fetcher: &dyn SchemaFetcher, addresses: &[String]) -> Option<String> {
    for address in addresses {
        if let Some(schema) = fetcher.fetch(address).await {
            return Some(schema);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    /// Serve one canned HTTP response and return the listener's address.
    async fn serve_once(status: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 {status}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn fetches_schema_body() {
        let addr = serve_once("200 OK", "openapi: 3.0.0\n").await;
        let schema = HttpSchemaFetcher::new().fetch(&addr).await;
        assert_eq!(schema.as_deref(), Some("openapi: 3.0.0\n"));
    }

    #[tokio::test]
    async fn non_success_status_yields_none() {
        let addr = serve_once("404 Not Found", "missing").await;
        assert!(HttpSchemaFetcher::new().fetch(&addr).await.is_none());
    }

    #[tokio::test]
    async fn refused_connection_yields_none() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let fetcher = HttpSchemaFetcher::new().with_timeout(Duration::from_millis(500));
        assert!(fetcher.fetch(&addr).await.is_none());
    }

    #[tokio::test]
    async fn fetch_first_skips_failures() {
        let bad = serve_once("500 Internal Server Error", "").await;
        let good = serve_once("200 OK", "openapi: 3.1.0").await;
        let schema = fetch_first(&HttpSchemaFetcher::new(), &[bad, good]).await;
        assert_eq!(schema.as_deref(), Some("openapi: 3.1.0"));
    }
}
