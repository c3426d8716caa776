mod action;
mod error;
mod message;
mod packet;
mod repository;
mod transport;

pub use action::*;
pub use error::*;
pub use message::*;
pub use packet::*;
pub use repository::*;
pub use transport::*;
