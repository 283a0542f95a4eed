//! Module sources.
//!
//! A source fetches module bytes by URI. The server resolves a URI to a
//! registered source by prefix, fetches through it under the program size
//! budget, and consults an advisory cache mapping canonical URI to module
//! id before fetching.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::types::{Error, ModuleId, Result};

/// Outcome of opening a source URI.
pub enum SourceContent {
    /// Module found; stream yields exactly `length` bytes.
    Found {
        stream: Pin<Box<dyn AsyncRead + Send>>,
        length: u64,
    },
    /// Module found but larger than the allowed size.
    TooLarge,
    /// No module at the URI.
    NotFound,
}

impl std::fmt::Debug for SourceContent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceContent::Found { length, .. } => {
                f.debug_struct("Found").field("length", length).finish()
            }
            SourceContent::TooLarge => f.write_str("TooLarge"),
            SourceContent::NotFound => f.write_str("NotFound"),
        }
    }
}

/// Fetches module bytes by URI.
#[async_trait]
pub trait Source: Send + Sync {
    /// Normalise a URI so that equivalent spellings share a cache entry.
    fn canonical_uri(&self, uri: &str) -> Result<String>;

    /// Open the URI, refusing content larger than `max_size`.
    async fn open_uri(&self, uri: &str, max_size: usize) -> Result<SourceContent>;
}

/// Advisory mapping from canonical URI to module id. Lookup happens before
/// every source fetch; a hit may short-circuit the build when the cached id
/// is already live. Store failures are reported but never fail the
/// operation.
#[async_trait]
pub trait SourceCache: Send + Sync {
    async fn get_source(&self, canonical_uri: &str) -> Result<Option<ModuleId>>;
    async fn put_source(&self, canonical_uri: &str, module: &ModuleId) -> Result<()>;
}

/// In-memory source cache, the construction default.
#[derive(Debug, Default)]
pub struct MemorySourceCache {
    entries: Mutex<HashMap<String, ModuleId>>,
}

#[async_trait]
impl SourceCache for MemorySourceCache {
    async fn get_source(&self, canonical_uri: &str) -> Result<Option<ModuleId>> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(canonical_uri)
            .cloned())
    }

    async fn put_source(&self, canonical_uri: &str, module: &ModuleId) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(canonical_uri.to_string(), module.clone());
        Ok(())
    }
}

/// Registered sources keyed by URI prefix.
#[derive(Default)]
pub struct SourceSet {
    sources: HashMap<String, Box<dyn Source>>,
}

impl std::fmt::Debug for SourceSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceSet")
            .field("prefixes", &self.sources.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SourceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a source under a URI prefix such as `/ipfs` or `https://`.
    pub fn register(&mut self, prefix: impl Into<String>, source: Box<dyn Source>) {
        self.sources.insert(prefix.into(), source);
    }

    pub fn prefixes(&self) -> Vec<String> {
        let mut prefixes: Vec<_> = self.sources.keys().cloned().collect();
        prefixes.sort();
        prefixes
    }

    /// Resolve a URI to its source. The URI must extend a registered prefix
    /// by at least one character.
    pub fn get(&self, uri: &str) -> Result<&dyn Source> {
        for (prefix, source) in &self.sources {
            if uri.len() > prefix.len() && uri.starts_with(prefix.as_str()) {
                return Ok(source.as_ref());
            }
        }
        Err(Error::ModuleNotFound)
    }
}

/// Fetches modules over HTTP(S) from a configured base.
#[cfg(feature = "http-source")]
pub mod http {
    use super::*;

    use futures::TryStreamExt;
    use tokio_util::io::StreamReader;

    #[derive(Debug, Clone)]
    pub struct HttpSource {
        client: reqwest::Client,
        base_url: String,
    }

    impl HttpSource {
        pub fn new(base_url: impl Into<String>) -> Self {
            Self {
                client: reqwest::Client::new(),
                base_url: base_url.into(),
            }
        }
    }

    #[async_trait]
    impl Source for HttpSource {
        fn canonical_uri(&self, uri: &str) -> Result<String> {
            // Strip duplicate slashes in the path part.
            let mut canonical = String::with_capacity(uri.len());
            let mut prev_slash = false;
            for c in uri.chars() {
                if c == '/' && prev_slash {
                    continue;
                }
                prev_slash = c == '/';
                canonical.push(c);
            }
            Ok(canonical)
        }

        async fn open_uri(&self, uri: &str, max_size: usize) -> Result<SourceContent> {
            let url = format!("{}{}", self.base_url, uri);
            let resp = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(|e| Error::unavailable(format!("source fetch {url}: {e}")))?;

            if resp.status() == reqwest::StatusCode::NOT_FOUND {
                return Ok(SourceContent::NotFound);
            }
            if !resp.status().is_success() {
                return Err(Error::unavailable(format!(
                    "source fetch {url}: status {}",
                    resp.status()
                )));
            }
            let Some(length) = resp.content_length() else {
                return Err(Error::unavailable(format!(
                    "source fetch {url}: missing content length"
                )));
            };
            if length > max_size as u64 {
                return Ok(SourceContent::TooLarge);
            }

            let stream = resp
                .bytes_stream()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
            Ok(SourceContent::Found {
                stream: Box::pin(StreamReader::new(stream)),
                length,
            })
        }
    }
}
