//! Guest module loading from a file or over HTTP(S).
//!
//! HTTP fetches use a single hyper HTTP/1 connection per request, over
//! rustls with the Mozilla root store for `https`. Any non-2xx response
//! is an error; redirects are not followed.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tracing::{debug, info};

use kubewasm_core::ModuleSource;

use crate::error::PluginError;

const USER_AGENT: &str = concat!("kubewasm/", env!("CARGO_PKG_VERSION"));

/// Read the module bytes from `source`, giving up on HTTP after `timeout`.
pub async fn load(source: &ModuleSource, timeout: Duration) -> Result<Vec<u8>, PluginError> {
    match source {
        ModuleSource::File { path } => {
            let bytes = tokio::fs::read(path).await.map_err(|source| PluginError::Io {
                path: path.clone(),
                source,
            })?;
            info!(%path, size = bytes.len(), "loaded guest module from file");
            Ok(bytes)
        }
        ModuleSource::Http { url, tls } => {
            let fetch_err = |reason: String| PluginError::Fetch {
                url: url.clone(),
                reason,
            };
            let bytes = tokio::time::timeout(timeout, fetch(url, *tls))
                .await
                .map_err(|_| fetch_err(format!("timed out after {timeout:?}")))?
                .map_err(fetch_err)?;
            info!(%url, size = bytes.len(), "fetched guest module");
            Ok(bytes)
        }
    }
}

fn tls_connector() -> Result<tokio_rustls::TlsConnector, String> {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = rustls::ClientConfig::builder_with_provider(rustls::crypto::ring::default_provider().into())
        .with_safe_default_protocol_versions()
        .map_err(|e| format!("tls protocol version error: {e}"))?
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(tokio_rustls::TlsConnector::from(Arc::new(config)))
}

async fn fetch(url: &str, tls: bool) -> Result<Vec<u8>, String> {
    let uri: http::Uri = url.parse().map_err(|e| format!("invalid url: {e}"))?;
    let host = uri.host().ok_or("url has no host")?.to_string();
    let port = uri.port_u16().unwrap_or(if tls { 443 } else { 80 });
    let authority = uri
        .authority()
        .map(|a| a.as_str().to_string())
        .unwrap_or_else(|| host.clone());

    let stream = TcpStream::connect((host.as_str(), port))
        .await
        .map_err(|e| format!("connect to {host}:{port}: {e}"))?;

    let request = http::Request::builder()
        .method("GET")
        .uri(uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/"))
        .header(http::header::HOST, authority)
        .header(http::header::USER_AGENT, USER_AGENT)
        .body(Empty::<Bytes>::new())
        .map_err(|e| format!("build request: {e}"))?;

    if tls {
        let server_name = rustls::pki_types::ServerName::try_from(host.clone())
            .map_err(|e| format!("invalid tls server name {host}: {e}"))?;
        let stream = tls_connector()?
            .connect(server_name, stream)
            .await
            .map_err(|e| format!("tls handshake with {host}: {e}"))?;
        send(TokioIo::new(stream), request).await
    } else {
        send(TokioIo::new(stream), request).await
    }
}

async fn send<IO>(io: IO, request: http::Request<Empty<Bytes>>) -> Result<Vec<u8>, String>
where
    IO: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| format!("http handshake: {e}"))?;

    // Drive the connection in the background.
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "guest fetch connection closed with error");
        }
    });

    let response = sender
        .send_request(request)
        .await
        .map_err(|e| format!("request failed: {e}"))?;

    let status = response.status();
    if !status.is_success() {
        return Err(format!("unexpected status {status}"));
    }

    let body = response
        .into_body()
        .collect()
        .await
        .map_err(|e| format!("read body: {e}"))?
        .to_bytes();
    Ok(body.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned HTTP response on a random local port.
    async fn serve_once(status_line: &'static str, body: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await.unwrap();
            let head = format!(
                "HTTP/1.1 {status_line}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                body.len()
            );
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.write_all(body).await.unwrap();
            socket.shutdown().await.unwrap();
        });
        format!("http://{addr}/plugin.wasm")
    }

    fn http(url: String) -> ModuleSource {
        ModuleSource::Http { url, tls: false }
    }

    #[tokio::test]
    async fn fetches_body_on_200() {
        let url = serve_once("200 OK", b"\0asm\x01\0\0\0").await;
        let bytes = load(&http(url), Duration::from_secs(5)).await.unwrap();
        assert_eq!(bytes, b"\0asm\x01\0\0\0");
    }

    #[tokio::test]
    async fn not_found_is_an_error() {
        let url = serve_once("404 Not Found", b"missing").await;
        let err = load(&http(url), Duration::from_secs(5)).await.unwrap_err();
        assert!(err.to_string().contains("404"), "{err}");
    }

    #[tokio::test]
    async fn server_error_is_an_error() {
        let url = serve_once("500 Internal Server Error", b"").await;
        let err = load(&http(url), Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, PluginError::Fetch { .. }), "{err}");
    }

    #[tokio::test]
    async fn connection_refused_is_an_error() {
        // Bind then drop to get a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = load(&http(format!("http://{addr}/x.wasm")), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::Fetch { .. }));
    }

    #[tokio::test]
    async fn reads_local_file() {
        let path = std::env::temp_dir().join(format!("kubewasm-fetch-{}.wasm", std::process::id()));
        std::fs::write(&path, b"bytes").unwrap();
        let source = ModuleSource::File {
            path: path.to_string_lossy().into_owned(),
        };
        assert_eq!(load(&source, Duration::from_secs(1)).await.unwrap(), b"bytes");
        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn missing_file_is_io_error() {
        let source = ModuleSource::File {
            path: "/nonexistent/kubewasm/plugin.wasm".to_string(),
        };
        let err = load(&source, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, PluginError::Io { .. }));
    }
}
