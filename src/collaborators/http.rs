//! HTTP download backend.
//!
//! Maps each work item identifier to a source URL and streams the response
//! body into the destination directory. The body lands in a dot-prefixed
//! temp file first and only takes its final name once complete, so a
//! finished name is always a finished download and never replaces one.

use super::Fetcher;
use crate::error::CollaboratorError;
use crate::models::SourceEntry;
use crate::recovery::CancelSignal;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

pub struct HttpFetcher {
    client: reqwest::Client,
    sources: HashMap<String, String>,
    cancel: Option<CancelSignal>,
}

impl HttpFetcher {
    pub fn new(sources: impl IntoIterator<Item = (String, String)>) -> Self {
        HttpFetcher {
            client: reqwest::Client::new(),
            sources: sources.into_iter().collect(),
            cancel: None,
        }
    }

    pub fn from_entries(entries: &[SourceEntry]) -> Self {
        Self::new(entries.iter().map(|e| (e.id.clone(), e.source.clone())))
    }

    /// Abandon in-flight downloads once `cancel` fires.
    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Source URL for `identifier`. Identifiers that are URLs resolve to themselves.
    pub fn source_for<'a>(&'a self, identifier: &'a str) -> Option<&'a str> {
        self.sources.get(identifier).map(String::as_str).or_else(|| {
            (identifier.starts_with("http://") || identifier.starts_with("https://")).then_some(identifier)
        })
    }

    async fn download(&self, identifier: &str, url: &str, target: &Path) -> Result<(), CollaboratorError> {
        let download_err = |reason: String| CollaboratorError::Download {
            identifier: identifier.to_string(),
            reason,
        };

        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| download_err(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(download_err(format!("HTTP {}", status)));
        }

        let dir = target.parent().unwrap_or_else(|| Path::new("."));
        let tmp = tempfile::Builder::new().prefix(".download-").tempfile_in(dir)?;
        let mut file = tokio::fs::File::from_std(tmp.reopen()?);
        let mut written: u64 = 0;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| download_err(format!("body read failed: {}", e)))?
        {
            if self.cancel.as_ref().map(|c| c.is_cancelled()).unwrap_or(false) {
                return Err(CollaboratorError::Cancelled);
            }
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        drop(file);

        tmp.persist_noclobber(target).map_err(|e| {
            download_err(format!("cannot move into {}: {}", target.display(), e.error))
        })?;
        log::debug!("[Download] {} -> {} ({} bytes)", url, target.display(), written);
        Ok(())
    }
}

/// Last path segment of `url`, without query or fragment.
pub fn file_name_from_url(url: &str) -> Option<String> {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    let after_scheme = without_query.split_once("://").map(|(_, rest)| rest).unwrap_or(without_query);
    let (_host, path) = after_scheme.split_once('/')?;
    path.rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, identifier: &str, destination_dir: &Path) -> Result<PathBuf, CollaboratorError> {
        let url = self
            .source_for(identifier)
            .ok_or_else(|| CollaboratorError::Download {
                identifier: identifier.to_string(),
                reason: "no source URL configured".to_string(),
            })?
            .to_string();

        let file_name = file_name_from_url(&url).unwrap_or_else(|| identifier.to_string());
        let target = destination_dir.join(file_name);

        log::info!("[Download] Fetching {} from {}", identifier, url);
        self.download(identifier, &url, &target).await?;
        Ok(target)
    }
}
