mod executor;
mod processor;
mod rules;
mod script;

pub use executor::*;
pub use processor::*;
pub use rules::*;
pub use script::*;

#[cfg(any(test, feature = "testing"))]
pub use executor::MockActionExecutor;
