//! Retry and token budgeting around model calls.

mod budget;
mod retry;

pub use budget::{BudgetTracker, LlmUsage};
pub use retry::RetryPolicy;
