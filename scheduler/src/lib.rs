mod dupefilter;
mod scheduler_trait;
mod schedulers;

pub use dupefilter::{DupeFilter, FingerprintDupeFilter};
pub use scheduler_trait::Scheduler;
pub use schedulers::{FifoScheduler, PriorityScheduler};

#[cfg(test)]
mod tests;
