//! HTTP plumbing for Skylark jobs: whole-resource downloads with file-name
//! resolution and the slow-host retry, plus the client for a peer instance's
//! file API.

pub mod downloader;
pub mod error;
pub mod filename;
pub mod remote;
pub mod retry;

pub use downloader::{Fetcher, RemoteResource};
pub use error::FetchError;
pub use remote::{AppClient, EntryKind, RemoteEntry, RemoteFile};
pub use retry::SlowHostPolicy;
