//! Client for the file API exposed by another instance of the front end.
//!
//! `GET /Api/Details/<path>` describes a single file, `GET /Api/List/<path>`
//! lists a directory and `GET /Download/<path>` serves the bytes. Both API
//! endpoints answer with a `{"status": ...}` envelope.

use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::error::FetchError;

/// Characters escaped inside one path segment.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RemoteFile {
    #[serde(default)]
    pub mime: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Directory,
    File,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteEntry {
    pub kind: EntryKind,
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    file: Option<RemoteFile>,
    #[serde(default)]
    entries: Option<Vec<RemoteEntry>>,
}

impl Envelope {
    fn ok(self) -> Result<Self, FetchError> {
        if self.status.eq_ignore_ascii_case("ok") {
            return Ok(self);
        }
        Err(FetchError::Remote {
            message: self.message.unwrap_or(self.status),
        })
    }
}

#[derive(Debug, Clone)]
pub struct AppClient {
    client: Client,
    base: String,
}

impl AppClient {
    /// `domain` is a bare host (`files.example.com:8080`) or a full origin.
    pub fn new(client: Client, domain: &str) -> Result<Self, FetchError> {
        let domain = domain.trim().trim_end_matches('/');
        if domain.is_empty() {
            return Err(FetchError::InvalidUrl {
                url: domain.to_owned(),
                message: "empty domain".to_owned(),
            });
        }
        let base = if domain.contains("://") {
            domain.to_owned()
        } else {
            format!("http://{domain}")
        };
        Ok(Self { client, base })
    }

    pub fn details_url(&self, path: &str) -> String {
        self.url("Api/Details", path)
    }

    pub fn list_url(&self, path: &str) -> String {
        self.url("Api/List", path)
    }

    pub fn download_url(&self, path: &str) -> String {
        self.url("Download", path)
    }

    /// Describe `path` as a single file. A non-`ok` status (the path is a
    /// directory, or missing) is [`FetchError::Remote`].
    pub async fn details(&self, path: &str) -> Result<RemoteFile, FetchError> {
        let envelope = self.get(&self.details_url(path)).await?.ok()?;
        envelope.file.ok_or_else(|| FetchError::Remote {
            message: format!("no file details for {path}"),
        })
    }

    pub async fn list(&self, path: &str) -> Result<Vec<RemoteEntry>, FetchError> {
        let envelope = self.get(&self.list_url(path)).await?.ok()?;
        Ok(envelope.entries.unwrap_or_default())
    }

    async fn get(&self, url: &str) -> Result<Envelope, FetchError> {
        debug!(url, "remote API request");
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_owned(),
                status,
            });
        }
        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    fn url(&self, endpoint: &str, path: &str) -> String {
        let encoded: Vec<String> = path
            .split(['/', '\\'])
            .filter(|s| !s.is_empty())
            .map(|s| utf8_percent_encode(s, SEGMENT).to_string())
            .collect();
        format!("{}/{endpoint}/{}", self.base, encoded.join("/"))
    }
}
