use std::path::PathBuf;
use std::sync::Arc;

use arachne_core::async_trait;
use arachne_core::error::Result;
use arachne_core::request::Request;
use arachne_core::stats::Stats;
use dashmap::DashSet;
use log::{debug, info};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Decides whether a request has been seen before
#[async_trait]
pub trait DupeFilter: Send + Sync + 'static {
    /// Prepare the filter, e.g. load persisted state
    async fn open(&self) -> Result<()> {
        Ok(())
    }

    /// Release resources, e.g. flush persisted state
    async fn close(&self) -> Result<()> {
        Ok(())
    }

    /// Return `true` if the request was seen before. Otherwise record it and
    /// return `false`. Recording and checking happen atomically.
    async fn request_seen(&self, request: &Request) -> Result<bool>;
}

/// Duplicate filter keyed on request fingerprints.
///
/// With a log path, every new fingerprint is appended to the file (one per
/// line) and flushed before `request_seen` returns, and the file is read
/// back on `open`.
pub struct FingerprintDupeFilter {
    fingerprints: DashSet<String>,
    path: Option<PathBuf>,
    file: Mutex<Option<File>>,
    stats: Option<Arc<Stats>>,
}

impl FingerprintDupeFilter {
    /// Create an in-memory filter
    pub fn new() -> Self {
        Self {
            fingerprints: DashSet::new(),
            path: None,
            file: Mutex::new(None),
            stats: None,
        }
    }

    /// Create a filter mirrored to an append-only log
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::new()
        }
    }

    /// Count filtered requests in the given stats
    pub fn with_stats(mut self, stats: Arc<Stats>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Number of known fingerprints
    pub fn len(&self) -> usize {
        self.fingerprints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fingerprints.is_empty()
    }
}

impl Default for FingerprintDupeFilter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DupeFilter for FingerprintDupeFilter {
    async fn open(&self) -> Result<()> {
        let path = match &self.path {
            Some(path) => path,
            None => return Ok(()),
        };

        if tokio::fs::try_exists(path).await? {
            let contents = tokio::fs::read_to_string(path).await?;
            for line in contents.lines().map(str::trim).filter(|l| !l.is_empty()) {
                self.fingerprints.insert(line.to_string());
            }
            info!(
                "Loaded {} fingerprints from {}",
                self.fingerprints.len(),
                path.display()
            );
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        *self.file.lock().await = Some(file);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some(mut file) = self.file.lock().await.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        Ok(())
    }

    async fn request_seen(&self, request: &Request) -> Result<bool> {
        let fingerprint = request.fingerprint();
        if !self.fingerprints.insert(fingerprint.to_string()) {
            debug!("Filtered duplicate request {}", request);
            if let Some(stats) = &self.stats {
                stats.inc("dupefilter/filtered");
            }
            return Ok(true);
        }

        let mut file = self.file.lock().await;
        if let Some(file) = file.as_mut() {
            let written = async {
                file.write_all(format!("{}\n", fingerprint).as_bytes()).await?;
                file.flush().await
            }
            .await;
            if let Err(e) = written {
                // unrecorded, so a later sighting is still admitted
                self.fingerprints.remove(fingerprint);
                return Err(e.into());
            }
        }
        Ok(false)
    }
}
