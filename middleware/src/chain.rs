use std::sync::Arc;

use arachne_core::async_trait;
use arachne_core::error::Result;
use arachne_core::spider::Spider;
use log::debug;

/// Order in which a phase visits its stages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Registration order: the first registered stage runs first
    Forward,
    /// Reverse registration order: the first registered stage runs last
    Reverse,
}

/// Behaviour shared by every registered stage, whatever phases it joins
#[async_trait]
pub trait Stage: Send + Sync + 'static {
    /// Get the name of this stage
    fn name(&self) -> &str;

    /// Called when a spider is opened
    async fn open_spider(&self, _spider: &dyn Spider) -> Result<()> {
        Ok(())
    }

    /// Called when a spider is closed
    async fn close_spider(&self, _spider: &dyn Spider) -> Result<()> {
        Ok(())
    }
}

/// Stages taking part in one phase, kept in the order the phase visits them
pub struct PhaseList<T: ?Sized> {
    direction: Direction,
    stages: Vec<Arc<T>>,
}

impl<T: ?Sized> PhaseList<T> {
    /// Create an empty list
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            stages: Vec::new(),
        }
    }

    /// Add a stage at the position implied by the list direction
    pub fn insert(&mut self, stage: Arc<T>) {
        match self.direction {
            Direction::Forward => self.stages.push(stage),
            Direction::Reverse => self.stages.insert(0, stage),
        }
    }

    /// Stages in visiting order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<T>> {
        self.stages.iter()
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

/// Ordered collection of registered stages.
///
/// Managers keep one `MiddlewareChain` for lifecycle hooks plus one
/// [`PhaseList`] per capability. Enter-side phases run forward, exit-side
/// phases run in reverse, which mirrors nested calls without nesting.
pub struct MiddlewareChain<M: ?Sized> {
    stages: Vec<Arc<M>>,
}

impl<M: ?Sized + Stage> MiddlewareChain<M> {
    /// Create an empty chain
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    /// Append a stage in registration order
    pub fn register(&mut self, stage: Arc<M>) {
        debug!("Registered middleware stage {}", stage.name());
        self.stages.push(stage);
    }

    /// Stages in registration order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<M>> {
        self.stages.iter()
    }

    /// Stage names in registration order
    pub fn names(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Open every stage in registration order, stopping at the first failure
    pub async fn open_spider(&self, spider: &dyn Spider) -> Result<()> {
        for stage in &self.stages {
            stage.open_spider(spider).await?;
        }
        Ok(())
    }

    /// Close every stage in reverse order. All stages are closed even if one
    /// fails; the first error is returned.
    pub async fn close_spider(&self, spider: &dyn Spider) -> Result<()> {
        let mut first_error = None;
        for stage in self.stages.iter().rev() {
            if let Err(e) = stage.close_spider(spider).await {
                log::error!("Error closing middleware stage {}: {}", stage.name(), e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl<M: ?Sized + Stage> Default for MiddlewareChain<M> {
    fn default() -> Self {
        Self::new()
    }
}
