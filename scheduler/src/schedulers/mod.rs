mod fifo_scheduler;
mod priority_scheduler;

pub use fifo_scheduler::FifoScheduler;
pub use priority_scheduler::PriorityScheduler;
