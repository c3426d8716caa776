pub mod config;
pub mod domain;
pub mod memory;
pub mod postgres;
pub mod telemetry;
pub mod validation;

pub use config::*;
pub use domain::*;

// Re-export mocks when testing feature is enabled
#[cfg(any(test, feature = "testing"))]
pub use domain::MockMessageRepository;
#[cfg(any(test, feature = "testing"))]
pub use domain::MockTelemetryPublisher;
