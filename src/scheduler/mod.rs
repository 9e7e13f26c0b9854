//! Ready-queue ordering.
//!
//! Every queue in the scheduler (the workers' private queues, the shared
//! queue and the lock waiter registries) is a min-heap over hierarchical
//! request keys, with ties broken by push order.

pub mod priority;

pub use priority::PriorityQueue;
