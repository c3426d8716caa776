mod backoff;
mod connector;
mod link;
mod mqtt;
mod state;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use backoff::*;
pub use connector::*;
pub use link::*;
pub use mqtt::*;
pub use state::*;
