pub mod catalog;
pub mod config;
pub mod consumer;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod generator;
pub mod metrics;
pub mod store;
pub mod types;

pub use config::Config;
pub use error::{Result, RustAclError};
