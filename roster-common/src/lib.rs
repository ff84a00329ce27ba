pub mod balancer;
pub mod eligibility;
pub mod error;
pub mod health;
#[cfg(test)]
mod memory;
pub mod metrics;
pub mod model;
pub mod pgqueue;
pub mod retry;
pub mod store;
