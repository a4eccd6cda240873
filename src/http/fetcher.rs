use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::{watch, Semaphore};
use url::Url;

use super::batch::{BatchHandle, BatchState, FetchItem, FetchStatus, ItemGuard};
use super::client::user_agent;
use super::url_builder::UrlBuilder;
use crate::config::Limits;
use crate::types::{CoreError, Result};

pub const PARTIAL_SUFFIX: &str = ".partial";

/// What to fetch and where to put it.
///
/// Each id becomes one request: `base/id`, or `base?param=id` when a query
/// parameter is set. The body is saved as `{prefix}{id}{suffix}` in the
/// output directory.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    base_url: String,
    query_param: Option<String>,
    ids: Vec<String>,
    prefix: String,
    suffix: String,
    output_dir: PathBuf,
}

impl FetchRequest {
    pub fn new<I, S>(base_url: impl Into<String>, ids: I, output_dir: impl Into<PathBuf>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            base_url: base_url.into(),
            query_param: None,
            ids: ids.into_iter().map(Into::into).collect(),
            prefix: String::new(),
            suffix: String::new(),
            output_dir: output_dir.into(),
        }
    }

    pub fn query_param(mut self, name: impl Into<String>) -> Self {
        self.query_param = Some(name.into());
        self
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    fn file_name(&self, id: &str) -> String {
        format!("{}{}{}", self.prefix, id, self.suffix)
    }
}

/// Downloads many resources concurrently into a directory, tracking a status
/// per item. At most `concurrency` requests are in flight at any time.
pub struct HttpDataFetcher {
    client: reqwest::Client,
    concurrency: usize,
}

impl HttpDataFetcher {
    pub fn new(concurrency: usize) -> Result<Self> {
        let concurrency = Limits::fetch_concurrency(concurrency);
        let client = reqwest::Client::builder()
            .user_agent(user_agent())
            .pool_max_idle_per_host(concurrency)
            .build()?;
        Ok(Self {
            client,
            concurrency,
        })
    }

    pub fn with_client(client: reqwest::Client, concurrency: usize) -> Self {
        Self {
            client,
            concurrency: Limits::fetch_concurrency(concurrency),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Starts a fetch batch and returns as soon as every item is scheduled.
    ///
    /// Fails without touching the network if the base URL is unusable, if no
    /// id survives trimming, or if the output directory cannot be used.
    /// Per-item problems never fail the call; they show up as `Failed` items.
    pub async fn fetch_to_dir(&self, request: FetchRequest) -> Result<BatchHandle> {
        let urls = UrlBuilder::new(&request.base_url)?;
        let ids = normalize_ids(&request.ids);
        if ids.is_empty() {
            return Err(CoreError::invalid("at least one non-blank id is required"));
        }
        prepare_output_dir(&request.output_dir).await?;

        let items = ids
            .iter()
            .map(|id| {
                let final_path = request.output_dir.join(request.file_name(id));
                let mut partial = final_path.clone().into_os_string();
                partial.push(PARTIAL_SUFFIX);
                FetchItem::new(id.clone(), final_path, PathBuf::from(partial))
            })
            .collect();
        let state = BatchState::new(items);
        let handle = BatchHandle::new(Arc::clone(&state));
        let permits = Arc::new(Semaphore::new(self.concurrency));

        tracing::info!(
            items = ids.len(),
            concurrency = self.concurrency,
            base_url = %urls.base(),
            output_dir = %request.output_dir.display(),
            "Starting fetch batch"
        );

        // A blank parameter name means the id goes into the path.
        let query_param = request
            .query_param
            .as_deref()
            .map(str::trim)
            .filter(|param| !param.is_empty());

        for (index, id) in ids.iter().enumerate() {
            let guard = ItemGuard::new(Arc::clone(&state), index);
            if let Err(reason) = validate_file_name(&request.file_name(id)) {
                tracing::warn!(id = %id, reason = %reason, "Item rejected before fetch");
                guard.finish(FetchStatus::Failed, Some(reason));
                continue;
            }

            let url = match query_param {
                Some(param) => urls.build(None, &[(param, id.as_str())]),
                None => urls.join_segment(id),
            };
            tokio::spawn(fetch_item(
                self.client.clone(),
                url,
                Arc::clone(&permits),
                guard,
            ));
        }

        Ok(handle)
    }
}

async fn fetch_item(client: reqwest::Client, url: Url, permits: Arc<Semaphore>, guard: ItemGuard) {
    let mut cancel = guard.cancel_receiver();
    let item = guard.item();

    let downloaded = tokio::select! {
        biased;
        _ = cancelled(&mut cancel) => {
            tracing::debug!(id = item.id(), "Fetch cancelled");
            guard.finish(FetchStatus::Cancelled, None);
            return;
        }
        result = download(&client, &url, item, &permits) => result,
    };

    // Body is on disk: cancellation no longer applies.
    let result = match downloaded {
        Ok(bytes) => tokio::fs::rename(item.partial_path(), item.final_path())
            .await
            .map(|_| bytes)
            .map_err(|e| {
                CoreError::Io(format!(
                    "cannot move {} into place: {}",
                    item.partial_path().display(),
                    e
                ))
            }),
        Err(e) => Err(e),
    };

    match result {
        Ok(bytes) => {
            tracing::debug!(id = item.id(), bytes, path = %item.final_path().display(), "Fetch completed");
            guard.finish(FetchStatus::Completed, None);
        }
        Err(e) => {
            tracing::warn!(id = item.id(), url = %url, error = %e, "Fetch failed");
            guard.finish(FetchStatus::Failed, Some(e.to_string()));
        }
    }
}

/// Streams the response body into the item's partial file. Returns the number
/// of bytes written.
async fn download(client: &reqwest::Client, url: &Url, item: &FetchItem, permits: &Semaphore) -> Result<u64> {
    let _permit = permits
        .acquire()
        .await
        .map_err(|_| CoreError::Internal("fetch permits closed".to_string()))?;

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(item.partial_path())
        .await
        .map_err(|e| {
            CoreError::Io(format!(
                "cannot create {}: {}",
                item.partial_path().display(),
                e
            ))
        })?;

    let response = client.get(url.clone()).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(CoreError::Http(format!("unexpected status {}", status)));
    }

    let mut written = 0u64;
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    Ok(written)
}

async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Trims every id, drops blank ones and keeps the first occurrence of each.
fn normalize_ids(ids: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.iter()
        .map(|id| id.trim())
        .filter(|id| !id.is_empty())
        .filter(|id| seen.insert(id.to_string()))
        .map(str::to_string)
        .collect()
}

/// Rejects names that would land outside the output directory.
fn validate_file_name(name: &str) -> std::result::Result<(), String> {
    if name == "." || name == ".." || name.contains(['/', '\\']) || name.contains('\0') {
        return Err(format!("unsafe file name: {:?}", name));
    }
    Ok(())
}

async fn prepare_output_dir(dir: &Path) -> Result<()> {
    if dir.as_os_str().is_empty() {
        return Err(CoreError::invalid("output directory cannot be blank"));
    }
    tokio::fs::create_dir_all(dir).await.map_err(|e| {
        CoreError::invalid(format!(
            "cannot create output directory {}: {}",
            dir.display(),
            e
        ))
    })?;
    let metadata = tokio::fs::metadata(dir).await?;
    if !metadata.is_dir() {
        return Err(CoreError::invalid(format!(
            "not a directory: {}",
            dir.display()
        )));
    }
    check_writable(dir.to_path_buf()).await
}

/// Creates and removes a scratch file in `dir`; permission bits alone do not
/// say whether the process may write there.
async fn check_writable(dir: PathBuf) -> Result<()> {
    tokio::task::spawn_blocking(move || {
        tempfile::Builder::new()
            .prefix(".write-check")
            .tempfile_in(&dir)
            .map(drop)
            .map_err(|e| {
                CoreError::invalid(format!(
                    "output directory is not writable: {}: {}",
                    dir.display(),
                    e
                ))
            })
    })
    .await
    .map_err(|e| CoreError::Internal(format!("writability check failed: {}", e)))?
}
