//! Hidden-session integration tests
//!
//! Drive the public API end to end against an in-process transport whose
//! commands answer from a script. Timer-driven tests run on tokio's paused
//! clock, so they finish instantly.
//!
//! ```bash
//! cargo test --test hidden_sessions
//! ```

pub mod fixtures;

mod adhoc_tests;
mod config_tests;
mod monitor_tests;
mod shutdown_tests;
