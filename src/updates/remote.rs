// src/updates/remote.rs

//! Out-of-band package index for foreign packages
//!
//! The HTTP index speaks the "multiinfo" JSON RPC used by community package
//! indexes: `GET <url>?type=multiinfo&arg[]=a&arg[]=b` answers with
//! `{"type": "multiinfo", "results": [{"Name", "Version", "URLPath"}, ...]}`.

use crate::error::{Error, Result};
use reqwest::blocking::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

/// Default timeout for index queries (30 seconds)
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// A package as reported by a remote index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePackage {
    pub name: String,
    pub version: String,
    pub source_path: String,
    pub download_size: u64,
}

/// Source of versions for packages outside the configured repositories
pub trait RemoteIndex: Send + Sync {
    /// Label shown as the repository of remote updates
    fn label(&self) -> &str;

    /// Look up the given package names; unknown names are simply absent
    fn lookup(&self, names: &[String]) -> Result<Vec<RemotePackage>>;
}

#[derive(Debug, Deserialize)]
struct MultiInfoReply {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    results: Vec<MultiInfoResult>,
}

#[derive(Debug, Deserialize)]
struct MultiInfoResult {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Version")]
    version: String,
    #[serde(rename = "URLPath", default)]
    url_path: Option<String>,
}

/// Remote index reached over HTTP
///
/// Queries go through a blocking client built per lookup: call `lookup` from
/// a blocking context, never from an async task.
pub struct HttpRemoteIndex {
    url: String,
    label: String,
}

impl HttpRemoteIndex {
    pub fn new(url: &str, label: &str) -> Result<Self> {
        if !(url.starts_with("https://") || url.starts_with("http://")) {
            return Err(Error::ConfigError(format!(
                "remote index url must be http(s): {}",
                url
            )));
        }
        Ok(Self {
            url: url.to_string(),
            label: label.to_string(),
        })
    }

    fn client(&self) -> Result<Client> {
        Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::Engine(format!("Failed to create HTTP client: {e}")))
    }
}

impl RemoteIndex for HttpRemoteIndex {
    fn label(&self) -> &str {
        &self.label
    }

    fn lookup(&self, names: &[String]) -> Result<Vec<RemotePackage>> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        info!("Querying {} for {} package(s)", self.url, names.len());

        let mut query: Vec<(&str, &str)> = vec![("type", "multiinfo")];
        query.extend(names.iter().map(|n| ("arg[]", n.as_str())));

        let reply: MultiInfoReply = self
            .client()?
            .get(&self.url)
            .query(&query)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::NotFound(format!("{}: {e}", self.url)))?
            .json()
            .map_err(|e| Error::ParseError(format!("{}: {e}", self.url)))?;

        if reply.kind == "error" {
            return Err(Error::NotFound(
                reply.error.unwrap_or_else(|| "remote index error".to_string()),
            ));
        }
        debug!("{} answered with {} result(s)", self.url, reply.results.len());

        Ok(reply
            .results
            .into_iter()
            .map(|r| RemotePackage {
                name: r.name,
                version: r.version,
                source_path: r.url_path.unwrap_or_default(),
                download_size: 0,
            })
            .collect())
    }
}
