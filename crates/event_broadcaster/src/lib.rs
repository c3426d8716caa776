mod broadcaster;
mod event;
mod subscription;

pub use broadcaster::*;
pub use event::*;
pub use subscription::*;
