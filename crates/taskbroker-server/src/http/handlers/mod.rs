//! HTTP request handlers.

mod health;
mod runners;
mod tasks;

pub use health::{health_check, metrics_handler};
pub use runners::{list_runners, stats};
pub use tasks::{await_task_result, cancel_task, get_task, submit_task, withdraw_task};
