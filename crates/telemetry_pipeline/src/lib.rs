mod health;
mod ingest;
mod pipeline;

pub use health::*;
pub use ingest::*;
pub use pipeline::*;
