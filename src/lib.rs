pub mod config;
pub mod data;
pub mod error;
pub mod fleet;
pub mod hooks;
pub mod node;
pub mod pods;
pub mod session;
pub mod sink;
pub mod task;

pub use error::Error;
