pub use args::Args;
pub use http::HttpExporter;
pub use sink::Sink;
pub use span::{Event, Span};

mod args;
mod http;
mod sink;
mod span;
