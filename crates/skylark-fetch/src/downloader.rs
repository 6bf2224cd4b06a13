use reqwest::header::{CONTENT_DISPOSITION, CONTENT_TYPE, REFERER};
use reqwest::{Client, Response};
use tracing::{debug, info, warn};

use crate::error::FetchError;
use crate::filename;
use crate::retry::SlowHostPolicy;

/// HTTP client for whole-resource downloads.
///
/// No request or read timeout is configured: a download runs for as long as
/// the server keeps the connection open.
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: Client,
    slow_hosts: SlowHostPolicy,
}

/// An opened download: response headers have arrived, the body has not been
/// read yet.
#[derive(Debug)]
pub struct RemoteResource {
    pub url: String,
    /// Sanitized file name from `Content-Disposition` or the URL tail.
    pub file_name: String,
    /// MIME essence of the `Content-Type` header, lowercased.
    pub content_type: Option<String>,
    pub length: Option<u64>,
    response: Response,
}

impl RemoteResource {
    pub fn into_response(self) -> Response {
        self.response
    }
}

impl Fetcher {
    /// Build a fetcher. Proxy is read from `HTTP_PROXY` / `HTTPS_PROXY`.
    pub fn new(slow_hosts: SlowHostPolicy) -> Result<Self, FetchError> {
        let mut builder =
            Client::builder().user_agent(concat!("skylark-fetch/", env!("CARGO_PKG_VERSION")));

        let proxy = std::env::var("HTTP_PROXY")
            .ok()
            .or_else(|| std::env::var("HTTPS_PROXY").ok());
        if let Some(proxy_url) = proxy {
            match reqwest::Proxy::all(&proxy_url) {
                Ok(p) => builder = builder.proxy(p),
                Err(e) => warn!(proxy = %proxy_url, error = %e, "ignoring invalid proxy URL"),
            }
        }

        Ok(Self::with_client(builder.build()?, slow_hosts))
    }

    pub fn with_client(client: Client, slow_hosts: SlowHostPolicy) -> Self {
        Self { client, slow_hosts }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Send the download request (Referer set to the URL itself) and resolve
    /// the response metadata.
    pub async fn open(&self, url: &str) -> Result<RemoteResource, FetchError> {
        let mut response = self.request(url).await?;
        if self
            .slow_hosts
            .should_retry(url, header(&response, CONTENT_TYPE.as_str()).as_deref())
        {
            info!(url, delay_secs = self.slow_hosts.delay().as_secs(), "slow host served a placeholder page; retrying once");
            drop(response);
            tokio::time::sleep(self.slow_hosts.delay()).await;
            response = self.request(url).await?;
        }

        let content_type = header(&response, CONTENT_TYPE.as_str())
            .and_then(|ct| ct.split(';').next().map(|e| e.trim().to_ascii_lowercase()))
            .filter(|e| e.contains('/'));
        let file_name = filename::resolve(
            header(&response, CONTENT_DISPOSITION.as_str()).as_deref(),
            response.url().as_str(),
        );
        let length = response.content_length();
        debug!(url, file_name = %file_name, content_type = ?content_type, length = ?length, "download opened");

        Ok(RemoteResource {
            url: url.to_owned(),
            file_name,
            content_type,
            length,
            response,
        })
    }

    async fn request(&self, url: &str) -> Result<Response, FetchError> {
        let response = self.client.get(url).header(REFERER, url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_owned(),
                status,
            });
        }
        Ok(response)
    }
}

fn header(response: &Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tracing_test::traced_test;

    /// Minimal HTTP/1.1 server answering each connection with the next
    /// canned response. Returns the base URL and the captured request heads.
    pub(crate) async fn serve(responses: Vec<String>) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&seen);
        tokio::spawn(async move {
            for response in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = socket.read(&mut buf).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    head.extend_from_slice(&buf[..n]);
                }
                captured
                    .lock()
                    .unwrap()
                    .push(String::from_utf8_lossy(&head).into_owned());
                socket.write_all(response.as_bytes()).await.unwrap();
                socket.shutdown().await.ok();
            }
        });
        (base, seen)
    }

    pub(crate) fn local_fetcher(policy: SlowHostPolicy) -> Fetcher {
        Fetcher::with_client(Client::builder().no_proxy().build().unwrap(), policy)
    }

    pub(crate) fn response(content_type: &str, extra: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 200 OK\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\n{extra}Connection: close\r\n\r\n{body}",
            body.len()
        )
    }

    #[tokio::test]
    async fn open_resolves_metadata_and_sends_referer() {
        let (base, seen) = serve(vec![response(
            "application/zip",
            "Content-Disposition: attachment; filename=\"rom%20v2.zip\"\r\n",
            "PK..",
        )])
        .await;
        let url = format!("{base}/files/download?id=1");

        let fetcher = local_fetcher(SlowHostPolicy::disabled());
        let resource = fetcher.open(&url).await.unwrap();
        assert_eq!(resource.file_name, "rom v2.zip");
        assert_eq!(resource.content_type.as_deref(), Some("application/zip"));
        assert_eq!(resource.length, Some(4));
        assert_eq!(resource.into_response().text().await.unwrap(), "PK..");

        let head = seen.lock().unwrap()[0].to_ascii_lowercase();
        assert!(head.contains(&format!("referer: {}", url.to_ascii_lowercase())));
    }

    #[tokio::test]
    #[traced_test]
    async fn slow_host_placeholder_is_retried_once() {
        let (base, seen) = serve(vec![
            response("text/html", "", "<html>wait</html>"),
            response("application/octet-stream", "", "data"),
        ])
        .await;
        let policy = SlowHostPolicy::new(vec![base.clone()], Duration::from_millis(10));
        let fetcher = local_fetcher(policy);

        let resource = fetcher.open(&format!("{base}/rom.bin")).await.unwrap();
        assert_eq!(resource.file_name, "rom.bin");
        assert_eq!(resource.into_response().text().await.unwrap(), "data");
        assert_eq!(seen.lock().unwrap().len(), 2);
        assert!(logs_contain("retrying once"));
    }

    #[tokio::test]
    async fn html_from_other_hosts_is_kept() {
        let (base, seen) = serve(vec![response("text/html", "", "<p>page</p>")]).await;
        let fetcher = local_fetcher(SlowHostPolicy::default());

        let resource = fetcher.open(&format!("{base}/index.html")).await.unwrap();
        assert_eq!(resource.content_type.as_deref(), Some("text/html"));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn error_status_is_reported() {
        let (base, _) = serve(vec![
            "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_owned(),
        ])
        .await;
        let fetcher = local_fetcher(SlowHostPolicy::disabled());
        let err = fetcher.open(&format!("{base}/missing")).await.unwrap_err();
        assert!(matches!(err, FetchError::Status { status, .. } if status.as_u16() == 404));
    }
}
