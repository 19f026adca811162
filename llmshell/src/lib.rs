pub mod allowlist;
pub mod api;
pub mod code;
pub mod config;
pub mod conversation;
pub mod diff;
pub mod error;
pub mod executor;
pub mod history;
pub mod logger;
pub mod models;
pub mod orchestrator;
pub mod parser;
pub mod service;
pub mod snapshot;
pub mod store;
pub mod tracker;

pub use error::{ShellError, ShellResult};
pub use service::Service;
