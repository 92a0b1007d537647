//! Streaming HTTP payloads.
//!
//! The response body is forwarded chunk by chunk into a [`ChannelSource`], so
//! the child starts receiving bytes before the download has finished.

use anyhow::Context;
use reqwest::header::CONTENT_TYPE;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use streamrelay_engine::source::ChannelItem;
use streamrelay_engine::{ChannelSource, SourceError};

/// Body chunks buffered between the download task and the relay.
pub const BODY_CHANNEL_CAPACITY: usize = 16;

/// Build the HTTP client used for payload downloads.
pub fn build_client() -> anyhow::Result<reqwest::Client> {
    // Ensure a TLS crypto provider is installed (reqwest uses rustls-no-provider).
    // The `Err` case just means it was already installed.
    let _ = rustls::crypto::ring::default_provider().install_default();

    reqwest::Client::builder()
        .user_agent(concat!("streamrelay/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to build HTTP client")
}

/// A response whose body is being streamed into `source`.
#[derive(Debug)]
pub struct FetchedBody {
    pub content_type: Option<String>,
    pub source: ChannelSource,
    /// Download task; ends on its own once the body or the relay is done.
    pub task: JoinHandle<()>,
}

/// Start downloading `url`.
///
/// Connection failures and non-success statuses are reported here, before
/// any child is spawned. Failures after the headers arrive reach the relay as
/// [`SourceError::Upstream`].
pub async fn fetch(client: &reqwest::Client, url: &str) -> anyhow::Result<FetchedBody> {
    let response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("Failed to fetch {url}"))?
        .error_for_status()
        .with_context(|| format!("Upstream rejected {url}"))?;

    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    info!(
        url,
        content_type = content_type.as_deref().unwrap_or("-"),
        length = ?response.content_length(),
        "Streaming payload"
    );

    let (tx, source) = ChannelSource::channel(BODY_CHANNEL_CAPACITY);
    let task = tokio::spawn(forward_body(response, tx));

    Ok(FetchedBody {
        content_type,
        source,
        task,
    })
}

async fn forward_body(mut response: reqwest::Response, tx: mpsc::Sender<ChannelItem>) {
    let mut received: u64 = 0;
    loop {
        let item = match response.chunk().await {
            // An empty chunk would read as end-of-stream to the relay.
            Ok(Some(bytes)) if bytes.is_empty() => continue,
            Ok(Some(bytes)) => {
                received += bytes.len() as u64;
                Ok(bytes.to_vec())
            }
            Ok(None) => {
                debug!(received, "Payload body complete");
                return;
            }
            Err(e) => {
                warn!(error = %e, received, "Payload body failed");
                Err(SourceError::Upstream(e.to_string()))
            }
        };

        let failed = item.is_err();
        if tx.send(item).await.is_err() {
            debug!(received, "Relay stopped reading payload");
            return;
        }
        if failed {
            return;
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use streamrelay_engine::ChunkSource;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn test_client() -> reqwest::Client {
        let _ = rustls::crypto::ring::default_provider().install_default();
        reqwest::Client::builder().no_proxy().build().unwrap()
    }

    /// Serve one canned HTTP response on a loopback port.
    async fn serve_once(response: &'static str) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = sock.read(&mut buf).await;
            sock.write_all(response.as_bytes()).await.unwrap();
            let _ = sock.shutdown().await;
        });
        format!("http://{addr}/dump.sql")
    }

    async fn drain(source: ChannelSource) -> Result<Vec<u8>, SourceError> {
        tokio::task::spawn_blocking(move || {
            let mut source = source;
            let mut out = Vec::new();
            while let Some(chunk) = source.next_chunk()? {
                out.extend_from_slice(&chunk);
            }
            Ok(out)
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn body_and_content_type_are_forwarded() {
        let url = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 11\r\nConnection: close\r\n\r\nhello world",
        )
        .await;

        let body = fetch(&test_client(), &url).await.unwrap();
        assert_eq!(body.content_type.as_deref(), Some("text/plain"));
        assert_eq!(drain(body.source).await.unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn error_status_fails_before_streaming() {
        let url = serve_once(
            "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;

        let err = fetch(&test_client(), &url).await.unwrap_err();
        assert!(err.to_string().contains("Upstream rejected"), "{err:#}");
    }

    #[tokio::test]
    async fn truncated_body_surfaces_as_upstream_error() {
        let url = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Type: binary/octet-stream\r\nContent-Length: 100\r\nConnection: close\r\n\r\nshort",
        )
        .await;

        let body = fetch(&test_client(), &url).await.unwrap();
        let err = drain(body.source).await.unwrap_err();
        assert!(matches!(err, SourceError::Upstream(_)));
    }

    #[tokio::test]
    async fn unreachable_host_is_reported() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = fetch(&test_client(), &format!("http://{addr}/"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Failed to fetch"));
    }
}
