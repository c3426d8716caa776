//! Validation of untrusted input.

mod report;
mod schema_validator;

pub(crate) use report::*;
pub use schema_validator::*;
