mod client;
mod config;
mod message_repository;
mod retry;

pub use client::*;
pub use config::*;
pub use message_repository::*;
pub use retry::*;
