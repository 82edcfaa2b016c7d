//! HTTP route handlers.

pub mod health;
pub mod queue;

pub use health::health_handler;
pub use queue::{create_test_jobs_handler, master_run_progress_handler, process_next_handler};
