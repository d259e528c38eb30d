use std::path::{Path, PathBuf};
use std::sync::Arc;

use arachne_core::async_trait;
use arachne_core::error::{Error, Result};
use arachne_core::item::Item;
use arachne_core::spider::Spider;
use arachne_middleware::{MiddlewareChain, Stage};
use log::{debug, error, info};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// A stage of the item phase
#[async_trait]
pub trait ItemPipeline: Stage {
    /// Process an item, returning it (possibly transformed) for the next stage.
    ///
    /// Return [`Error::ItemDropped`] to discard the item deliberately.
    async fn process_item(&self, item: Item, spider: &dyn Spider) -> Result<Item>;
}

/// Runs items through the registered pipelines in registration order
pub struct ItemPipelineManager {
    pipelines: MiddlewareChain<dyn ItemPipeline>,
}

impl ItemPipelineManager {
    pub fn new() -> Self {
        Self {
            pipelines: MiddlewareChain::new(),
        }
    }

    /// Add a pipeline at the end of the chain
    pub fn register<P: ItemPipeline>(&mut self, pipeline: P) {
        self.register_arc(Arc::new(pipeline));
    }

    pub fn register_arc(&mut self, pipeline: Arc<dyn ItemPipeline>) {
        self.pipelines.register(pipeline);
    }

    pub fn names(&self) -> Vec<String> {
        self.pipelines.names()
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    pub async fn open_spider(&self, spider: &dyn Spider) -> Result<()> {
        self.pipelines.open_spider(spider).await
    }

    pub async fn close_spider(&self, spider: &dyn Spider) -> Result<()> {
        self.pipelines.close_spider(spider).await
    }

    /// Pass `item` through every pipeline. The first error stops the chain.
    pub async fn process_item(&self, item: Item, spider: &dyn Spider) -> Result<Item> {
        let mut current = item;
        for pipeline in self.pipelines.iter() {
            current = pipeline.process_item(current, spider).await?;
        }
        Ok(current)
    }
}

impl Default for ItemPipelineManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Pipeline that logs items
pub struct LogPipeline {
    /// Log level to use
    level: log::Level,
}

impl LogPipeline {
    /// Create a new log pipeline
    pub fn new(level: log::Level) -> Self {
        Self { level }
    }

    /// Create a new log pipeline with INFO level
    pub fn info() -> Self {
        Self::new(log::Level::Info)
    }

    /// Create a new log pipeline with DEBUG level
    pub fn debug() -> Self {
        Self::new(log::Level::Debug)
    }
}

impl Default for LogPipeline {
    fn default() -> Self {
        Self::info()
    }
}

impl Stage for LogPipeline {
    fn name(&self) -> &str {
        "LogPipeline"
    }
}

#[async_trait]
impl ItemPipeline for LogPipeline {
    async fn process_item(&self, item: Item, spider: &dyn Spider) -> Result<Item> {
        log::log!(self.level, "Spider '{}' scraped item: {}", spider.name(), item);
        Ok(item)
    }
}

/// Pipeline that appends items to a file, one JSON object per line
pub struct JsonLinesPipeline {
    path: PathBuf,
    file: Mutex<Option<File>>,
    append: bool,
}

impl JsonLinesPipeline {
    /// Write to `path`, truncating it when the spider opens
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            file: Mutex::new(None),
            append: false,
        }
    }

    /// Keep existing lines instead of truncating
    pub fn append(mut self, append: bool) -> Self {
        self.append = append;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Stage for JsonLinesPipeline {
    fn name(&self) -> &str {
        "JsonLinesPipeline"
    }

    async fn open_spider(&self, spider: &dyn Spider) -> Result<()> {
        let mut options = OpenOptions::new();
        options.create(true);
        if self.append {
            options.append(true);
        } else {
            options.write(true).truncate(true);
        }
        let file = options.open(&self.path).await?;
        *self.file.lock().await = Some(file);

        info!(
            "Writing items of spider '{}' to {}",
            spider.name(),
            self.path.display()
        );
        Ok(())
    }

    async fn close_spider(&self, _spider: &dyn Spider) -> Result<()> {
        if let Some(mut file) = self.file.lock().await.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ItemPipeline for JsonLinesPipeline {
    async fn process_item(&self, item: Item, _spider: &dyn Spider) -> Result<Item> {
        let mut line = item.to_json()?;
        line.push('\n');

        let mut guard = self.file.lock().await;
        match guard.as_mut() {
            Some(file) => {
                file.write_all(line.as_bytes()).await?;
                file.flush().await?;
            }
            None => {
                error!(
                    "{} is not open, item not written: {}",
                    self.path.display(),
                    item
                );
                return Err(Error::item(format!(
                    "output file {} is not open",
                    self.path.display()
                )));
            }
        }
        Ok(item)
    }
}

/// Drops items that lack any of the required fields
pub struct FieldFilterPipeline {
    required: Vec<String>,
}

impl FieldFilterPipeline {
    pub fn new<S: Into<String>>(required: impl IntoIterator<Item = S>) -> Self {
        Self {
            required: required.into_iter().map(Into::into).collect(),
        }
    }
}

impl Stage for FieldFilterPipeline {
    fn name(&self) -> &str {
        "FieldFilterPipeline"
    }
}

#[async_trait]
impl ItemPipeline for FieldFilterPipeline {
    async fn process_item(&self, item: Item, _spider: &dyn Spider) -> Result<Item> {
        let missing: Vec<&str> = self
            .required
            .iter()
            .filter(|field| !item.has_field(field))
            .map(String::as_str)
            .collect();

        if missing.is_empty() {
            Ok(item)
        } else {
            debug!("Dropping item without {:?}: {}", missing, item);
            Err(Error::ItemDropped(format!(
                "missing fields: {}",
                missing.join(", ")
            )))
        }
    }
}

/// Pipeline that keeps items matching a predicate and drops the rest
pub struct FilterPipeline<F>
where
    F: Fn(&Item) -> bool + Send + Sync + 'static,
{
    filter: F,
}

impl<F> FilterPipeline<F>
where
    F: Fn(&Item) -> bool + Send + Sync + 'static,
{
    pub fn new(filter: F) -> Self {
        Self { filter }
    }
}

impl<F> Stage for FilterPipeline<F>
where
    F: Fn(&Item) -> bool + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        "FilterPipeline"
    }
}

#[async_trait]
impl<F> ItemPipeline for FilterPipeline<F>
where
    F: Fn(&Item) -> bool + Send + Sync + 'static,
{
    async fn process_item(&self, item: Item, _spider: &dyn Spider) -> Result<Item> {
        if (self.filter)(&item) {
            Ok(item)
        } else {
            Err(Error::ItemDropped("Item filtered out".to_string()))
        }
    }
}
